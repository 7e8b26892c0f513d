//! Chunk planning: split a file into fixed-size byte ranges.

use crate::config::chunk_size_or_default;

/// One chunk of a file: byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True for the chunk starting at offset 0.
    pub fn is_first(&self) -> bool {
        self.start == 0
    }
}

/// Iterator over the chunks of a file, in order.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_len: u64,
    chunk_size: u64,
    next: u64,
}

impl Iterator for ChunkPlan {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.next >= self.total_len {
            return None;
        }
        let start = self.next;
        let end = (start + self.chunk_size).min(self.total_len);
        self.next = end;
        Some(ChunkRange { start, end })
    }
}

/// Split `total_len` bytes into chunks of `chunk_size`. A zero chunk size uses the default.
pub fn split_into_chunks(total_len: u64, chunk_size: usize) -> ChunkPlan {
    ChunkPlan {
        total_len,
        chunk_size: chunk_size_or_default(chunk_size) as u64,
        next: 0,
    }
}

/// Number of data frames a file of `total_len` bytes produces: `ceil(total_len / chunk_size)`.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    total_len.div_ceil(chunk_size_or_default(chunk_size) as u64)
}
