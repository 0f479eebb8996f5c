//! Pool coordinator: the public pin/unpin surface.
//!
//! A single `pool_mutex` (here `parking_lot::Mutex<PoolState>`) guards the
//! block index, the intrusive lists, the arena allocator, and the thread
//! registry for the coordinator's full duration. This is coarse by design:
//! critical sections are short, and a single lock is easy to reason about.
//! Misses perform their file read while holding this mutex; a "drop the
//! mutex, read, reacquire, then check for a concurrent double-load" split is
//! possible but not implemented here.

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bufferpool::arena::ArenaAllocator;
use crate::bufferpool::block_index::BlockIndex;
use crate::bufferpool::checksum::{NoopVerifier, PageVerifier};
use crate::bufferpool::config::BufferPoolConfig;
use crate::bufferpool::error::{BufferPoolError, Result};
use crate::bufferpool::file::{FileReader, PagedFile};
use crate::bufferpool::list::{BlockLists, ListId};
use crate::bufferpool::maintenance;
use crate::bufferpool::thread_registry::ThreadRegistry;
use crate::bufferpool::types::{
    block_of, page_in_block, FileBlockId, PageId, VirtualBlockId, BLOCK_SIZE, PAGES_PER_BLOCK,
    PAGE_SIZE,
};
use crate::bufferpool::vm::VmReservation;

/// How many tail candidates a single `free_unlocked` sweep examines. Not
/// spec-mandated; chosen so one sweep's pool-mutex hold time stays short.
const FREE_BATCH: usize = 64;

/// Allocates a virtual block, reads `block`'s bytes into it, and verifies
/// every page present (`byte_len` may be short, for the file's final
/// block). Frees the speculative virtual block and propagates the error on
/// any failure, so no half-loaded block is ever left allocated.
fn load_block_into(
    file: &dyn FileReader,
    verifier: &dyn PageVerifier,
    arena: &mut ArenaAllocator,
    byte_len: usize,
    block: FileBlockId,
) -> Result<VirtualBlockId> {
    let vb = arena.alloc_block()?;

    let buf = unsafe { std::slice::from_raw_parts_mut(arena.block_ptr(vb), BLOCK_SIZE) };
    if let Err(e) = file.read_block(block, buf) {
        arena.free_block(vb, false);
        return Err(e);
    }

    let pages_present = (byte_len + PAGE_SIZE - 1) / PAGE_SIZE;
    for p in 0..pages_present {
        let page_bytes = &buf[p * PAGE_SIZE..(p + 1) * PAGE_SIZE];
        if let Err(e) = verifier.verify(block, p as u8, page_bytes) {
            warn!(block, page = p, "page failed verification on load");
            arena.free_block(vb, false);
            return Err(e);
        }
    }
    Ok(vb)
}

struct PoolState {
    block_index: BlockIndex,
    lists: BlockLists,
    arena: ArenaAllocator,
    threads: ThreadRegistry,
    /// One `u64` per page slot: bit `t` set iff thread index `t` holds a pin
    /// on that page. Indexed `[file_block as usize][page_in_block as usize]`.
    page_thread_masks: Vec<[u64; PAGES_PER_BLOCK]>,
    last_access_time: Vec<u64>,
    access_counter: u64,
}

impl PoolState {
    fn thread_mask(&self, block: FileBlockId, page: u8) -> u64 {
        self.page_thread_masks[block as usize][page as usize]
    }

    fn set_thread_bit(&mut self, block: FileBlockId, page: u8, idx: usize) {
        self.page_thread_masks[block as usize][page as usize] |= 1 << idx;
    }

    fn clear_thread_bit(&mut self, block: FileBlockId, page: u8, idx: usize) {
        self.page_thread_masks[block as usize][page as usize] &= !(1 << idx);
    }

    fn touch(&mut self, block: FileBlockId) -> u64 {
        self.access_counter += 1;
        self.last_access_time[block as usize] = self.access_counter;
        self.access_counter
    }
}

/// Shared pool state plus everything immutable for the pool's lifetime,
/// referenced both by [`BufferPool`] and by the background maintenance
/// thread.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    maintenance_cv: Condvar,
    shutdown: AtomicBool,
    file: Box<dyn FileReader>,
    verifier: Box<dyn PageVerifier>,
    vm: Arc<VmReservation>,
    config: BufferPoolConfig,
    page_count: u32,
    block_count: u32,
    last_block_pages: u8,
    init_thread: ThreadId,
    zero_block_addr: usize,
}

impl PoolShared {
    fn resolved_max_pool(&self) -> u64 {
        self.config
            .max_pool
            .unwrap_or(self.block_count as u64 * BLOCK_SIZE as u64)
    }

    fn capacity_blocks(&self) -> usize {
        (self.resolved_max_pool() / BLOCK_SIZE as u64) as usize
    }

    fn block_byte_len(&self, block: FileBlockId) -> usize {
        if block as u32 == self.block_count - 1 {
            self.last_block_pages as usize * PAGE_SIZE
        } else {
            BLOCK_SIZE
        }
    }

    /// Loads `block` from the backing file into a freshly allocated virtual
    /// block, verifying every page before it becomes visible. On any
    /// failure the speculative virtual block is freed before returning.
    fn load_block(&self, state: &mut PoolState, block: FileBlockId) -> Result<VirtualBlockId> {
        let len = self.block_byte_len(block);
        match load_block_into(self.file.as_ref(), self.verifier.as_ref(), &mut state.arena, len, block) {
            Ok(vb) => Ok(vb),
            Err(BufferPoolError::OutOfMemory) => {
                self.free_unlocked_locked(state, false);
                load_block_into(self.file.as_ref(), self.verifier.as_ref(), &mut state.arena, len, block)
            }
            Err(e) => Err(e),
        }
    }

    /// Evicts from the tail of the unlocked list. Caller already holds the
    /// state lock.
    fn free_unlocked_locked(&self, state: &mut PoolState, decommit: bool) -> usize {
        let mut released = 0;
        for _ in 0..FREE_BATCH {
            let Some(block) = state.lists.unlocked_tail() else {
                break;
            };
            if state.block_index.lock_mask(block) != 0 {
                // Shouldn't happen: only lock_mask == 0 blocks live on the
                // unlocked list. Defensive skip rather than evicting a live
                // page.
                break;
            }
            let Some(vb) = state.block_index.virtual_of(block) else {
                break;
            };
            state.lists.remove(block);
            state.block_index.clear_resident(block);
            state.page_thread_masks[block as usize] = [0; PAGES_PER_BLOCK];
            state.arena.free_block(vb, decommit);
            released += 1;
        }
        if released > 0 {
            debug!(released, decommit, "free_unlocked evicted blocks");
        }
        released
    }

    pub(crate) fn free_unlocked(&self, decommit: bool) -> usize {
        let mut state = self.state.lock();
        self.free_unlocked_locked(&mut state, decommit)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn maintenance_period(&self) -> Duration {
        self.config.maintenance_period
    }

    pub(crate) fn low_water_blocks(&self) -> usize {
        let min_pool = self
            .config
            .min_pool
            .unwrap_or(self.block_count as u64 * BLOCK_SIZE as u64);
        (min_pool / BLOCK_SIZE as u64) as usize
    }

    pub(crate) fn resident_blocks(&self) -> usize {
        self.state.lock().arena.live_blocks()
    }

    pub(crate) fn wait_or_shutdown(&self, timeout: Duration) {
        let mut guard = self.state.lock();
        if self.is_shutdown() {
            return;
        }
        self.maintenance_cv.wait_for(&mut guard, timeout);
    }

    /// Clears thread `owner_thread_idx`'s pin on `page_id`, moving the
    /// block to the unlocked list if this was the last pin. Used by
    /// [`PageHandle::drop`], which captures the thread index at pin time so
    /// the unpin is correct even if the handle is dropped on another thread.
    fn unpin_as(&self, page_id: PageId, owner_thread_idx: usize) -> bool {
        let block = block_of(page_id);
        if block == 0 {
            return false;
        }
        let page = page_in_block(page_id);
        let mut state = self.state.lock();
        state.clear_thread_bit(block, page, owner_thread_idx);
        if state.thread_mask(block, page) != 0 {
            trace!(page_id, "unpin: other threads still hold this page");
            return false;
        }
        let remaining = state.block_index.clear_page_lock(block, page);
        if remaining != 0 {
            return false;
        }
        if state.lists.member_of(block) == Some(ListId::Locked) {
            state.lists.move_to_front(ListId::Unlocked, block);
        }
        trace!(page_id, "unpin: block fully released");
        true
    }
}

/// RAII handle to a pinned page. Derefs to the page's 8 KB image; dropping
/// it unpins the page for the thread that created the handle.
pub struct PageHandle {
    shared: Arc<PoolShared>,
    page_id: PageId,
    ptr: *const u8,
    owner_thread_idx: usize,
    is_zero: bool,
}

unsafe impl Send for PageHandle {}

impl Deref for PageHandle {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*(self.ptr as *const [u8; PAGE_SIZE]) }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.is_zero {
            return;
        }
        self.shared.unpin_as(self.page_id, self.owner_thread_idx);
    }
}

/// The buffer pool: reserves a VM range sized to `max_pool`, opens the
/// backing file, and serves pinned page views on demand.
pub struct BufferPool {
    shared: Arc<PoolShared>,
    maintenance: Option<JoinHandle<()>>,
}

impl BufferPool {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, BufferPoolConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: BufferPoolConfig) -> Result<Self> {
        let file = PagedFile::open(path.as_ref())?;
        Self::open_with_collaborators(Box::new(file), config)
    }

    /// Opens a pool over a caller-supplied file reader and the default
    /// no-op verifier. Exposed so tests can substitute a fake file reader
    /// or a verifier that rejects specific pages.
    pub fn open_with_collaborators(
        file: Box<dyn FileReader>,
        config: BufferPoolConfig,
    ) -> Result<Self> {
        Self::open_with_verifier(file, Box::new(NoopVerifier), config)
    }

    pub fn open_with_verifier(
        file: Box<dyn FileReader>,
        verifier: Box<dyn PageVerifier>,
        config: BufferPoolConfig,
    ) -> Result<Self> {
        let file_len = file.len_bytes()?;
        if file_len <= BLOCK_SIZE as u64 {
            return Err(BufferPoolError::BadFile(
                "file must be larger than one block".into(),
            ));
        }
        if file_len % PAGE_SIZE as u64 != 0 {
            return Err(BufferPoolError::BadFile(
                "file size is not a multiple of the page size".into(),
            ));
        }
        if file_len > crate::bufferpool::types::MAX_FILESIZE {
            return Err(BufferPoolError::BadFile("file exceeds maximum size".into()));
        }

        let total_pages = file_len / PAGE_SIZE as u64;
        let block_count = ((file_len + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as u32;
        let last_block_pages =
            (total_pages - (block_count as u64 - 1) * PAGES_PER_BLOCK as u64) as u8;
        let page_count = total_pages as u32;

        let max_pool = config
            .max_pool
            .unwrap_or(block_count as u64 * BLOCK_SIZE as u64);
        if max_pool < BLOCK_SIZE as u64 {
            return Err(BufferPoolError::BadFile(
                "max_pool must hold at least one block".into(),
            ));
        }
        if max_pool > file_len {
            return Err(BufferPoolError::BadFile(
                "max_pool exceeds file size".into(),
            ));
        }
        if let Some(min_pool) = config.min_pool {
            if min_pool > max_pool {
                return Err(BufferPoolError::BadFile(
                    "min_pool exceeds max_pool".into(),
                ));
            }
        }

        let vm = Arc::new(VmReservation::reserve(max_pool as usize)?);
        let mut arena = ArenaAllocator::new(Arc::clone(&vm));
        let init_thread = thread::current().id();

        let vb0 = load_block_into(file.as_ref(), verifier.as_ref(), &mut arena, BLOCK_SIZE, 0)?;
        let zero_block_addr = unsafe { arena.block_ptr(vb0) } as usize;

        let mut block_index = BlockIndex::new(block_count as usize);
        block_index.set_resident(0, vb0);

        let state = PoolState {
            block_index,
            lists: BlockLists::new(block_count as usize),
            arena,
            threads: ThreadRegistry::new(),
            page_thread_masks: vec![[0u64; PAGES_PER_BLOCK]; block_count as usize],
            last_access_time: vec![0u64; block_count as usize],
            access_counter: 0,
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(state),
            maintenance_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            file,
            verifier,
            vm,
            config,
            page_count,
            block_count,
            last_block_pages,
            init_thread,
            zero_block_addr,
        });

        let maintenance_shared = Arc::clone(&shared);
        let maintenance = if shared.config.enable_adaptive_lists {
            Some(thread::spawn(move || maintenance::run(maintenance_shared)))
        } else {
            None
        };

        Ok(Self {
            shared,
            maintenance,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.shared.page_count
    }

    pub fn block_count(&self) -> u32 {
        self.shared.block_count
    }

    pub fn live_blocks(&self) -> usize {
        self.shared.resident_blocks()
    }

    pub fn pin(&self, page_id: PageId) -> Result<PageHandle> {
        if page_id >= self.shared.page_count {
            return Err(BufferPoolError::OutOfRange(page_id));
        }
        let block = block_of(page_id);
        let page = page_in_block(page_id);

        if block == 0 {
            // The zero block is resident for the pool's whole lifetime at a
            // fixed address; no locking or bookkeeping needed to read it.
            let ptr = self.shared.zero_block_addr as *const u8;
            return Ok(PageHandle {
                shared: Arc::clone(&self.shared),
                page_id,
                ptr: unsafe { ptr.add(page as usize * PAGE_SIZE) },
                owner_thread_idx: 0,
                is_zero: true,
            });
        }

        let mut state = self.shared.state.lock();
        let thread_idx = state.threads.index_for(thread::current().id())?;

        if state.block_index.resident(block) {
            trace!(page_id, "pin hit");
            let vb = state.block_index.virtual_of(block).unwrap();
            state.block_index.set_page_lock(block, page);
            state.set_thread_bit(block, page, thread_idx);
            state.touch(block);
            match state.lists.member_of(block) {
                Some(ListId::Fixed) => {}
                _ => state.lists.move_to_front(ListId::Locked, block),
            }
            let ptr = unsafe { state.arena.block_ptr(vb).add(page as usize * PAGE_SIZE) };
            return Ok(PageHandle {
                shared: Arc::clone(&self.shared),
                page_id,
                ptr,
                owner_thread_idx: thread_idx,
                is_zero: false,
            });
        }

        trace!(page_id, "pin miss: loading block from file");
        if state.arena.live_blocks() >= self.shared.capacity_blocks() {
            self.shared.free_unlocked_locked(&mut state, false);
            if state.arena.live_blocks() >= self.shared.capacity_blocks() {
                return Err(BufferPoolError::OutOfMemory);
            }
        }
        let vb = self.shared.load_block(&mut state, block)?;

        let is_init_thread = thread::current().id() == self.shared.init_thread;
        state.block_index.set_resident(block, vb);
        state.block_index.set_page_lock(block, page);
        state.set_thread_bit(block, page, thread_idx);
        state.touch(block);
        if is_init_thread {
            state.block_index.mark_fixed(block);
            state.lists.push_front(ListId::Fixed, block);
        } else {
            state.lists.push_front(ListId::Locked, block);
        }

        let ptr = unsafe { state.arena.block_ptr(vb).add(page as usize * PAGE_SIZE) };
        Ok(PageHandle {
            shared: Arc::clone(&self.shared),
            page_id,
            ptr,
            owner_thread_idx: thread_idx,
            is_zero: false,
        })
    }

    /// Explicitly unpins a page, returning whether this was the last pin on
    /// its block (i.e. it moved from the locked to the unlocked list).
    /// Equivalent to dropping the handle, except the transition is
    /// observable; callers that don't need the return value can simply let
    /// the handle drop.
    pub fn unpin(&self, handle: PageHandle) -> bool {
        let was_last = if handle.is_zero {
            false
        } else {
            self.shared.unpin_as(handle.page_id, handle.owner_thread_idx)
        };
        std::mem::forget(handle);
        was_last
    }

    /// Clears every lock bit `tid` holds across the pool, moving any block
    /// whose overall lock mask drops to zero onto the unlocked list. Called
    /// at thread exit so a thread that forgot to drop its handles cannot
    /// wedge blocks on the locked list forever.
    pub fn unpin_thread(&self, tid: ThreadId) {
        let mut state = self.shared.state.lock();
        let Some(thread_idx) = state.threads.lookup(tid) else {
            return;
        };
        for block in 0..self.shared.block_count {
            if block == 0 || !state.block_index.resident(block) {
                continue;
            }
            for page in 0..PAGES_PER_BLOCK as u8 {
                if state.thread_mask(block, page) & (1 << thread_idx) == 0 {
                    continue;
                }
                state.clear_thread_bit(block, page, thread_idx);
                if state.thread_mask(block, page) != 0 {
                    continue;
                }
                let remaining = state.block_index.clear_page_lock(block, page);
                if remaining == 0 && state.lists.member_of(block) == Some(ListId::Locked) {
                    state.lists.move_to_front(ListId::Unlocked, block);
                }
            }
        }
        state.threads.release(tid);
    }

    pub fn free_unlocked(&self, decommit: bool) -> usize {
        self.shared.free_unlocked(decommit)
    }

    pub fn close(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.maintenance_cv.notify_all();
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.maintenance_cv.notify_all();
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.join();
        }
    }
}
