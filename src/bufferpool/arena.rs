//! Arena/block allocator.
//!
//! Partitions the reserved VM range into 1 MB arenas of 16 blocks each and
//! hands out single 64 KB blocks in amortized O(1) via two singly linked,
//! index-based lists: arenas that are partially used ("mixed") and arenas
//! that have been fully decommitted ("free"). List linkage is `Option<u32>`
//! arena indices rather than pointers, so the lists stay plain data.

use std::sync::Arc;

use crate::bufferpool::error::{BufferPoolError, Result};
use crate::bufferpool::types::{VirtualBlockId, ARENA_SIZE, BLOCKS_PER_ARENA, BLOCK_SIZE};
use crate::bufferpool::vm::VmReservation;

#[derive(Clone, Copy, Debug)]
struct Arena {
    block_mask: u16,
    next_arena: Option<u32>,
}

impl Arena {
    const fn empty() -> Self {
        Self {
            block_mask: 0,
            next_arena: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.block_mask == 0
    }

    fn is_full(&self) -> bool {
        self.block_mask == 0xFFFF
    }
}

/// Allocates and frees single blocks out of a reserved VM range, arena by
/// arena.
pub struct ArenaAllocator {
    vm: Arc<VmReservation>,
    capacity: usize,
    arenas: Vec<Arena>,
    free_head: Option<u32>,
    mixed_head: Option<u32>,
    live_blocks: usize,
}

impl ArenaAllocator {
    pub fn new(vm: Arc<VmReservation>) -> Self {
        let capacity = vm.capacity_arenas();
        Self {
            vm,
            capacity,
            arenas: Vec::new(),
            free_head: None,
            mixed_head: None,
            live_blocks: 0,
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.live_blocks
    }

    #[inline]
    unsafe fn block_ptr_raw(&self, vb: VirtualBlockId) -> *mut u8 {
        self.vm.ptr(vb as usize * BLOCK_SIZE)
    }

    /// Raw pointer to the start of the committed block `vb`.
    ///
    /// # Safety
    /// `vb` must currently be allocated (returned by `alloc_block` and not
    /// yet passed to `free_block`).
    pub unsafe fn block_ptr(&self, vb: VirtualBlockId) -> *mut u8 {
        self.block_ptr_raw(vb)
    }

    fn push_mixed(&mut self, idx: u32) {
        self.arenas[idx as usize].next_arena = self.mixed_head;
        self.mixed_head = Some(idx);
    }

    fn pop_mixed(&mut self) -> Option<u32> {
        let idx = self.mixed_head?;
        self.mixed_head = self.arenas[idx as usize].next_arena;
        self.arenas[idx as usize].next_arena = None;
        Some(idx)
    }

    /// Remove an arbitrary arena from the mixed list. O(n) in the number of
    /// mixed arenas (bounded by `max_pool / ARENA_SIZE`); only called when a
    /// mixed arena transitions straight to empty.
    fn remove_mixed(&mut self, target: u32) {
        if self.mixed_head == Some(target) {
            self.mixed_head = self.arenas[target as usize].next_arena;
            self.arenas[target as usize].next_arena = None;
            return;
        }
        let mut cur = self.mixed_head;
        while let Some(i) = cur {
            let next = self.arenas[i as usize].next_arena;
            if next == Some(target) {
                self.arenas[i as usize].next_arena = self.arenas[target as usize].next_arena;
                self.arenas[target as usize].next_arena = None;
                return;
            }
            cur = next;
        }
    }

    fn push_free(&mut self, idx: u32) {
        self.arenas[idx as usize].next_arena = self.free_head;
        self.free_head = Some(idx);
    }

    fn pop_free(&mut self) -> Option<u32> {
        let idx = self.free_head?;
        self.free_head = self.arenas[idx as usize].next_arena;
        self.arenas[idx as usize].next_arena = None;
        Some(idx)
    }

    /// Allocate a single block: committed VM, zeroed contents.
    pub fn alloc_block(&mut self) -> Result<VirtualBlockId> {
        if let Some(idx) = self.pop_mixed() {
            let bit = (!self.arenas[idx as usize].block_mask).trailing_zeros();
            self.arenas[idx as usize].block_mask |= 1 << bit;
            self.live_blocks += 1;
            if !self.arenas[idx as usize].is_full() {
                self.push_mixed(idx);
            }
            let vb = idx * BLOCKS_PER_ARENA as u32 + bit;
            // This bit's VM stayed committed (and possibly non-zero, left
            // over from its previous occupant) across the earlier
            // `free_block`; only a whole-arena decommit re-zeroes via the
            // OS, so zero explicitly here to uphold the "zeroed contents"
            // contract.
            unsafe {
                std::ptr::write_bytes(self.block_ptr_raw(vb), 0, BLOCK_SIZE);
            }
            return Ok(vb);
        }

        if let Some(idx) = self.pop_free() {
            self.vm.commit(idx as usize * ARENA_SIZE, ARENA_SIZE)?;
            self.arenas[idx as usize].block_mask = 1;
            self.live_blocks += 1;
            self.push_mixed(idx);
            return Ok(idx * BLOCKS_PER_ARENA as u32);
        }

        if self.arenas.len() >= self.capacity {
            return Err(BufferPoolError::OutOfMemory);
        }
        let idx = self.arenas.len() as u32;
        self.arenas.push(Arena::empty());
        self.vm.commit(idx as usize * ARENA_SIZE, ARENA_SIZE)?;
        self.arenas[idx as usize].block_mask = 1;
        self.live_blocks += 1;
        self.push_mixed(idx);
        Ok(idx * BLOCKS_PER_ARENA as u32)
    }

    /// Release a block back to its arena. When `decommit` is set and the
    /// arena becomes empty, its VM is returned to the OS immediately;
    /// otherwise the now-empty arena is parked on the free list still
    /// committed, to be decommitted by a later maintenance sweep.
    pub fn free_block(&mut self, vb: VirtualBlockId, decommit: bool) {
        let idx = vb / BLOCKS_PER_ARENA as u32;
        let bit = vb % BLOCKS_PER_ARENA as u32;
        let arena = &mut self.arenas[idx as usize];
        let was_full = arena.is_full();
        arena.block_mask &= !(1u16 << bit);
        self.live_blocks -= 1;

        if self.arenas[idx as usize].is_empty() {
            if decommit {
                self.vm.decommit(idx as usize * ARENA_SIZE, ARENA_SIZE);
            }
            if !was_full {
                self.remove_mixed(idx);
            }
            self.push_free(idx);
        } else if was_full {
            self.push_mixed(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_allocator(arenas: usize) -> ArenaAllocator {
        let vm = Arc::new(VmReservation::reserve(arenas * ARENA_SIZE).unwrap());
        ArenaAllocator::new(vm)
    }

    #[test]
    fn alloc_fills_one_arena_before_extending() {
        let mut a = new_allocator(2);
        let mut blocks = Vec::new();
        for _ in 0..BLOCKS_PER_ARENA {
            blocks.push(a.alloc_block().unwrap());
        }
        assert_eq!(a.live_blocks(), BLOCKS_PER_ARENA);
        assert!(blocks.iter().all(|&vb| vb < BLOCKS_PER_ARENA as u32));
        let next = a.alloc_block().unwrap();
        assert!(next >= BLOCKS_PER_ARENA as u32);
    }

    #[test]
    fn free_then_alloc_reuses_bit() {
        let mut a = new_allocator(1);
        let vb0 = a.alloc_block().unwrap();
        let vb1 = a.alloc_block().unwrap();
        a.free_block(vb0, false);
        assert_eq!(a.live_blocks(), 1);
        let vb2 = a.alloc_block().unwrap();
        assert_eq!(vb2, vb0);
        assert_ne!(vb1, vb2);
    }

    #[test]
    fn emptying_arena_returns_it_to_free_list() {
        let mut a = new_allocator(1);
        let blocks: Vec<_> = (0..BLOCKS_PER_ARENA).map(|_| a.alloc_block().unwrap()).collect();
        for vb in &blocks {
            a.free_block(*vb, true);
        }
        assert_eq!(a.live_blocks(), 0);
        // Arena is on the free list now; allocation reuses it without
        // touching the high-water mark.
        let vb = a.alloc_block().unwrap();
        assert_eq!(vb / BLOCKS_PER_ARENA as u32, 0);
    }

    #[test]
    fn out_of_memory_once_reservation_is_exhausted() {
        let mut a = new_allocator(1);
        for _ in 0..BLOCKS_PER_ARENA {
            a.alloc_block().unwrap();
        }
        assert!(matches!(a.alloc_block(), Err(BufferPoolError::OutOfMemory)));
    }

    #[test]
    fn live_blocks_matches_total_popcount() {
        let mut a = new_allocator(2);
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(a.alloc_block().unwrap());
        }
        for vb in held.drain(..5) {
            a.free_block(vb, false);
        }
        assert_eq!(a.live_blocks(), 15);
    }
}
