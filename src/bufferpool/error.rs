use thiserror::Error;

use crate::bufferpool::types::PageId;

/// Errors surfaced by the buffer pool's public API.
///
/// Every variant is fatal only to the call that produced it; the pool
/// remains usable afterward. See the module-level docs in `pool` for the
/// invariant that every miss-load error path frees its speculative
/// virtual block before returning.
#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("bad file: {0}")]
    BadFile(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("page {0} is out of range")]
    OutOfRange(PageId),

    #[error("page {0} failed checksum verification")]
    CorruptPage(PageId),

    #[error("thread registry is full")]
    TooManyThreads,

    #[error("operation attempted after close")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BufferPoolError>;
