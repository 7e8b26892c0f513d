//! Storage for received files: streamed disk sinks and delivery of buffered artifacts.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skiff_core::progress::format_size;
use skiff_core::{ReceivedFile, Sink, SinkOpen, SinkProvider};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

/// Reduce a peer-supplied name to a safe final path component.
pub fn sanitize_name(name: &str) -> Option<String> {
    if name.contains('\0') {
        return None;
    }
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` that does not exist yet.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

async fn create_unique(dir: &Path, name: &str) -> io::Result<(File, PathBuf)> {
    let safe = sanitize_name(name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("unusable file name {name:?}")))?;
    loop {
        let path = unique_path(dir, &safe);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path)),
            // Lost a race with another writer; pick the next free name.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Delivery step: write a completed batch into `dir`. Returns the paths written.
pub async fn save_files(dir: &Path, files: Vec<ReceivedFile>) -> io::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut saved = Vec::with_capacity(files.len());
    for f in files {
        let (mut file, path) = create_unique(dir, &f.name).await?;
        file.write_all(&f.artifact).await?;
        file.sync_all().await?;
        info!(event = "file_delivered", path = %path.display(), bytes = f.size, content_type = %f.content_type);
        saved.push(path);
    }
    Ok(saved)
}

/// Streamed save target on disk. A partial file is removed on abort.
pub struct FileSink {
    path: PathBuf,
    out: BufWriter<File>,
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.out.flush().await?;
        self.out.get_ref().sync_all().await?;
        info!(event = "file_delivered", path = %self.path.display(), "Streamed file saved");
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        let _ = self.out.flush().await;
        debug!(event = "partial_removed", path = %self.path.display());
        tokio::fs::remove_file(&self.path).await
    }
}

/// Asks the user whether a large file may be written straight to disk.
#[async_trait]
pub trait SavePrompt: Send {
    async fn confirm(&mut self, name: &str, size: u64) -> io::Result<bool>;
}

/// Terminal prompt on stdin. Anything but "n"/"no" accepts.
pub struct StdinPrompt;

#[async_trait]
impl SavePrompt for StdinPrompt {
    async fn confirm(&mut self, name: &str, size: u64) -> io::Result<bool> {
        eprint!("Save {name} ({}) to disk? [Y/n] ", format_size(size));
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(!matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no"))
    }
}

/// Storage sink capability backed by the download directory.
pub struct DiskSinks {
    dir: PathBuf,
    enabled: bool,
    prompt: Option<Box<dyn SavePrompt>>,
}

impl DiskSinks {
    pub fn new(dir: PathBuf, enabled: bool, prompt: Option<Box<dyn SavePrompt>>) -> Self {
        Self { dir, enabled, prompt }
    }
}

#[async_trait]
impl SinkProvider for DiskSinks {
    fn supports_streaming(&self) -> bool {
        self.enabled
    }

    async fn open_sink(&mut self, suggested_name: &str, size: u64) -> io::Result<SinkOpen> {
        if let Some(prompt) = self.prompt.as_mut() {
            if !prompt.confirm(suggested_name, size).await? {
                return Ok(SinkOpen::Declined);
            }
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let (file, path) = create_unique(&self.dir, suggested_name).await?;
        info!(event = "sink_opened", path = %path.display(), bytes = size);
        Ok(SinkOpen::Opened(Box::new(FileSink {
            path,
            out: BufWriter::new(file),
        })))
    }
}
