//! Backing file access.
//!
//! Reads are positioned (`pread`, via `FileExt::read_exact_at`) rather than
//! going through a shared seek cursor, so concurrent misses on different
//! threads can actually overlap at the OS level instead of serializing on a
//! cursor no caller can see.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::bufferpool::error::Result;
use crate::bufferpool::types::BLOCK_SIZE;

/// Abstraction over "a source of block-sized reads", so tests can substitute
/// an in-memory fake without touching the filesystem.
pub trait FileReader: Send + Sync {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()>;
    fn len_blocks(&self) -> Result<u64>;
    fn len_bytes(&self) -> Result<u64>;
}

/// A real backing file, accessed read-only via positioned reads so no shared
/// seek cursor is needed across concurrently pinning threads. The pool never
/// mutates page content, so the file is opened without write access.
pub struct PagedFile {
    file: File,
}

impl PagedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl FileReader for PagedFile {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = block as u64 * BLOCK_SIZE as u64;
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            // Reading a block past current EOF (first touch of a new block)
            // yields zeroed contents rather than an error.
            buf.fill(0);
            return Ok(());
        }
        let avail = (file_len - offset).min(BLOCK_SIZE as u64) as usize;
        self.file.read_exact_at(&mut buf[..avail], offset)?;
        buf[avail..].fill(0);
        Ok(())
    }

    fn len_blocks(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        Ok((len + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64)
    }

    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
