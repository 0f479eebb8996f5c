//! Page buffer pool for an 8 KB-paged on-disk database file.

pub mod bufferpool;

pub use bufferpool::{
    BufferPool, BufferPoolBuilder, BufferPoolConfig, BufferPoolError, DenylistVerifier,
    PageHandle, PageVerifier, Result,
};
