//! Virtual memory reservation for the arena allocator.
//!
//! Reserves one contiguous address range up front with `mmap(PROT_NONE)` and
//! commits/decommits arena-sized (1 MB) chunks inside it via `mprotect` and
//! `madvise`: reservation never moves, so a committed block's address is
//! stable for the pool's lifetime, and a decommitted range faults instead of
//! silently returning stale bytes.

use std::ptr::NonNull;

use crate::bufferpool::error::{BufferPoolError, Result};
use crate::bufferpool::types::ARENA_SIZE;

/// A single contiguous, page-granularity virtual address reservation.
pub struct VmReservation {
    base: NonNull<u8>,
    reserved_bytes: usize,
}

// SAFETY: the reservation is a fixed address range; callers synchronize
// access to the bytes within it (the pool's `pool_mutex` for metadata, and
// the read-only contract on committed pages for data).
unsafe impl Send for VmReservation {}
unsafe impl Sync for VmReservation {}

impl VmReservation {
    /// Reserve `bytes` (rounded up to an arena multiple) of address space.
    /// No physical memory is committed.
    pub fn reserve(bytes: usize) -> Result<Self> {
        let rounded = round_up_to_arena(bytes).max(ARENA_SIZE);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BufferPoolError::OutOfMemory);
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(BufferPoolError::OutOfMemory)?;
        Ok(Self {
            base,
            reserved_bytes: rounded,
        })
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    pub fn capacity_arenas(&self) -> usize {
        self.reserved_bytes / ARENA_SIZE
    }

    /// Bring `[offset, offset+len)` into committed, zero-filled state.
    /// Idempotent: calling this twice for the same range without an
    /// intervening decommit is a harmless no-op at the OS level.
    pub fn commit(&self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset + len <= self.reserved_bytes);
        let addr = unsafe { self.base.as_ptr().add(offset) };
        let rc = unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(BufferPoolError::OutOfMemory);
        }
        unsafe {
            libc::madvise(addr as *mut libc::c_void, len, libc::MADV_WILLNEED);
        }
        Ok(())
    }

    /// Return `[offset, offset+len)` to the OS. A later read without a
    /// preceding `commit` faults rather than returning stale data.
    pub fn decommit(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.reserved_bytes);
        let addr = unsafe { self.base.as_ptr().add(offset) };
        unsafe {
            libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
            libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE);
        }
    }

    /// Raw pointer into the reservation. Caller must only dereference bytes
    /// within a currently committed range.
    ///
    /// # Safety
    /// The caller is responsible for staying within `[0, reserved_bytes)`
    /// and for not reading a range that has been decommitted.
    pub unsafe fn ptr(&self, offset: usize) -> *mut u8 {
        self.base.as_ptr().add(offset)
    }
}

impl Drop for VmReservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.reserved_bytes);
        }
    }
}

fn round_up_to_arena(bytes: usize) -> usize {
    let rem = bytes % ARENA_SIZE;
    if rem == 0 {
        bytes
    } else {
        bytes + (ARENA_SIZE - rem)
    }
}
