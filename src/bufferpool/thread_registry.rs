//! Maps the calling thread to a small stable index for per-thread lock bits.
//!
//! `std::thread::ThreadId` has no `Ord` impl in stable Rust, so lookup is a
//! linear scan over a tombstoned `Vec` rather than a binary search over a
//! sorted one; at up to `MAX_THREADS` entries the asymptotic difference is
//! immaterial.

use std::thread::ThreadId;

use crate::bufferpool::error::{BufferPoolError, Result};
use crate::bufferpool::types::MAX_THREADS;

pub struct ThreadRegistry {
    slots: Vec<Option<ThreadId>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_THREADS),
        }
    }

    /// Returns the calling thread's stable index, registering it on first
    /// use. Errors once `MAX_THREADS` distinct threads are live.
    pub fn index_for(&mut self, id: ThreadId) -> Result<usize> {
        if let Some(pos) = self.slots.iter().position(|s| *s == Some(id)) {
            return Ok(pos);
        }
        if let Some(pos) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[pos] = Some(id);
            return Ok(pos);
        }
        if self.slots.len() >= MAX_THREADS {
            return Err(BufferPoolError::TooManyThreads);
        }
        self.slots.push(Some(id));
        Ok(self.slots.len() - 1)
    }

    /// Looks up a thread's index without registering it. Used by cleanup
    /// paths that must not assign a slot to a thread that never pinned
    /// anything through this pool.
    pub fn lookup(&self, id: ThreadId) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(id))
    }

    /// Releases a thread's slot once it can no longer hold any pins. Callers
    /// only do this during explicit deregistration (none today); threads
    /// that simply exit keep their slot for the pool's lifetime.
    pub fn release(&mut self, id: ThreadId) {
        if let Some(slot) = self.slots.iter_mut().find(|s| **s == Some(id)) {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_thread_gets_stable_index() {
        let mut r = ThreadRegistry::new();
        let id = std::thread::current().id();
        let a = r.index_for(id).unwrap();
        let b = r.index_for(id).unwrap();
        assert_eq!(a, b);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn lookup_does_not_register_an_unseen_thread() {
        let r = ThreadRegistry::new();
        let id = std::thread::current().id();
        assert_eq!(r.lookup(id), None);
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let mut r = ThreadRegistry::new();
        let id = std::thread::current().id();
        let a = r.index_for(id).unwrap();
        r.release(id);
        assert_eq!(r.len(), 0);
        let b = r.index_for(id).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_many_threads_errors_past_capacity() {
        let mut r = ThreadRegistry::new();
        let handles: Vec<_> = (0..MAX_THREADS)
            .map(|_| std::thread::spawn(std::thread::current().id))
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for id in &ids {
            r.index_for(*id).unwrap();
        }
        let one_more = std::thread::spawn(std::thread::current().id)
            .join()
            .unwrap();
        assert!(matches!(
            r.index_for(one_more),
            Err(BufferPoolError::TooManyThreads)
        ));
    }
}
