//! Shared constants and id types for the buffer pool.
//!
//! Sizes follow the on-disk layout the pool is built for: 8 KB pages grouped
//! eight to a 64 KB block, sixteen blocks to a 1 MB arena (the unit the VM
//! allocator commits and decommits as a whole).

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Number of pages in one block.
pub const PAGES_PER_BLOCK: usize = 8;

/// Size of one block in bytes (64 KB).
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;

/// Number of blocks in one arena.
pub const BLOCKS_PER_ARENA: usize = 16;

/// Size of one arena in bytes (1 MB).
pub const ARENA_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_ARENA;

/// Upper bound on concurrent pinning threads (fits a `u64` per-page lock mask).
pub const MAX_THREADS: usize = 64;

/// Largest file this pool will open: ~2^32 blocks of 64 KB.
pub const MAX_FILESIZE: u64 = (1u64 << 32) * BLOCK_SIZE as u64;

/// 32-bit file-relative page number.
pub type PageId = u32;

/// 0-based index of a block within the backing file.
pub type FileBlockId = u32;

/// 0-based index of a block within the reserved VM range.
pub type VirtualBlockId = u32;

/// Sentinel for "no virtual block" in a block index entry.
pub const NO_BLOCK: VirtualBlockId = u32::MAX;

/// `block_id = page >> 3`.
#[inline]
pub fn block_of(page_id: PageId) -> FileBlockId {
    page_id / PAGES_PER_BLOCK as u32
}

/// `page_in_block = page & 7`.
#[inline]
pub fn page_in_block(page_id: PageId) -> u8 {
    (page_id % PAGES_PER_BLOCK as u32) as u8
}
