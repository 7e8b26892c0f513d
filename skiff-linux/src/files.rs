//! Disk-backed file sources for the origin.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skiff_core::FileSource;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Content-type hint from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("iso") => "application/x-iso9660-image",
        _ => "application/octet-stream",
    }
}

/// A regular file opened for ranged reads.
#[derive(Debug)]
pub struct DiskFile {
    name: String,
    size: u64,
    content_type: &'static str,
    file: File,
}

impl DiskFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        Ok(Self {
            name,
            size: meta.len(),
            content_type: content_type_for(path),
            file,
        })
    }

    /// Open every path, in order.
    pub async fn open_all(paths: &[PathBuf]) -> io::Result<Vec<Self>> {
        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            out.push(Self::open(p).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl FileSource for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn content_type(&self) -> &str {
        self.content_type
    }

    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("a/b/report.PDF")), "application/pdf");
        assert_eq!(content_type_for(Path::new("notes.txt")), "text/plain");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("x.unknown")), "application/octet-stream");
    }

    #[tokio::test]
    async fn ranged_reads() {
        let mut f = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        f.write_all(b"0123456789").unwrap();
        let mut src = DiskFile::open(f.path()).await.unwrap();
        assert_eq!(src.size(), 10);
        assert_eq!(src.content_type(), "application/octet-stream");
        assert_eq!(src.read_chunk(4, 3).await.unwrap(), b"456");
        assert_eq!(src.read_chunk(0, 2).await.unwrap(), b"01");
        assert!(src.read_chunk(8, 5).await.is_err());
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskFile::open(dir.path()).await.is_err());
    }
}
