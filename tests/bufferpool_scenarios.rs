// Cross-module scenarios exercising the buffer pool end to end against a
// real backing file. Each test builds its own fixture via `tempfile` so
// tests never interfere with one another.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bufferpool::{BufferPool, BufferPoolBuilder, BufferPoolError, DenylistVerifier, FileReader, PagedFile, Result};
use tempfile::NamedTempFile;

const BLOCK_SIZE: u64 = 8192 * 8;

fn fixture_of(blocks: u64) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.as_file_mut().set_len(blocks * BLOCK_SIZE).unwrap();
    f.flush().unwrap();
    f
}

/// Wraps a real file, counting how many times each block is actually read
/// from disk, so tests can assert a pin hit performed no I/O. The counts
/// live behind a shared `Arc` so the test can inspect them after the file
/// itself has been moved into the pool.
struct CountingFile {
    inner: PagedFile,
    reads: Arc<Mutex<HashMap<u32, u32>>>,
}

impl CountingFile {
    fn open(path: &std::path::Path) -> (Self, Arc<Mutex<HashMap<u32, u32>>>) {
        let reads = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                inner: PagedFile::open(path).unwrap(),
                reads: Arc::clone(&reads),
            },
            reads,
        )
    }
}

impl FileReader for CountingFile {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        *self.reads.lock().unwrap().entry(block).or_insert(0) += 1;
        self.inner.read_block(block, buf)
    }

    fn len_blocks(&self) -> Result<u64> {
        self.inner.len_blocks()
    }

    fn len_bytes(&self) -> Result<u64> {
        self.inner.len_bytes()
    }
}

#[test]
fn scenario_eviction_keeps_residency_at_ceiling() {
    let fixture = fixture_of(128);
    let config = BufferPoolBuilder::new()
        .max_pool(64 * BLOCK_SIZE)
        .enable_adaptive_lists(false)
        .build();
    let pool = BufferPool::open_with_config(fixture.path(), config).unwrap();

    // Pin from a worker thread so none of these blocks become fixed (only
    // the pool-opening thread's first pins are exempt from eviction).
    thread::scope(|s| {
        s.spawn(|| {
            for b in 1u32..128 {
                let handle = pool.pin(b * 8).unwrap();
                drop(handle);
            }
        });
    });

    assert!(pool.live_blocks() <= 64, "residency must respect max_pool");
}

#[test]
fn scenario_repeated_pin_unpin_reads_block_once() {
    let fixture = fixture_of(8);
    let (file, read_counts) = CountingFile::open(fixture.path());
    let config = BufferPoolBuilder::new().build();
    let pool = Arc::new(BufferPool::open_with_collaborators(Box::new(file), config).unwrap());

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..1000 {
                    let h = pool.pin(17).unwrap();
                    drop(h);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let n = *read_counts.lock().unwrap().get(&2).unwrap_or(&0);
    assert_eq!(n, 1, "block 2 must be read from disk exactly once");
}

#[test]
fn scenario_fixed_block_survives_worker_unpin_all() {
    let fixture = fixture_of(200);
    let config = BufferPoolBuilder::new()
        .enable_adaptive_lists(false)
        .build();
    let pool = BufferPool::open_with_config(fixture.path(), config).unwrap();

    // Init (main) thread pins page 1000 first: block 125 becomes fixed.
    let init_handle = pool.pin(1000).unwrap();

    let worker_tid = thread::scope(|s| {
        s.spawn(|| {
            // Simulate a thread that exits without unpinning; cleanup is
            // the main thread's job via `unpin_thread` below.
            let h = pool.pin(1000).unwrap();
            std::mem::forget(h);
            thread::current().id()
        })
        .join()
        .unwrap()
    });

    pool.unpin_thread(worker_tid);
    drop(init_handle);

    assert_eq!(pool.free_unlocked(false), 0, "fixed block is not an eviction candidate");
}

#[test]
fn scenario_corrupt_page_fails_pin_and_frees_block() {
    let fixture = fixture_of(8);
    let verifier = DenylistVerifier::new([(1, 1)]);
    let config = BufferPoolBuilder::new().build();
    let file = PagedFile::open(fixture.path()).unwrap();
    let pool = BufferPool::open_with_verifier(Box::new(file), Box::new(verifier), config).unwrap();

    let before = pool.live_blocks();
    let err = pool.pin(9).unwrap_err();
    assert!(matches!(err, BufferPoolError::CorruptPage(9)));
    assert_eq!(pool.live_blocks(), before, "a failed load must not change residency");
}

#[test]
fn scenario_maintenance_sweep_trends_toward_low_water_mark() {
    let fixture = fixture_of(32);
    let config = BufferPoolBuilder::new()
        .min_pool(4 * BLOCK_SIZE)
        .max_pool(16 * BLOCK_SIZE)
        .maintenance_period(Duration::from_millis(50))
        .build();
    let pool = BufferPool::open_with_config(fixture.path(), config).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..1024u32 {
                let block = 1 + (i % 31);
                let h = pool.pin(block * 8).unwrap();
                drop(h);
            }
        });
    });

    assert!(pool.live_blocks() <= 16);
    thread::sleep(Duration::from_millis(300));
    assert!(pool.live_blocks() <= 4, "after a maintenance tick residency should trend to min_pool");
}

#[test]
fn scenario_close_without_pins_releases_cleanly() {
    let fixture = fixture_of(4);
    let pool = BufferPool::open(fixture.path()).unwrap();
    assert_eq!(pool.live_blocks(), 1); // just the zero block
    pool.close();
}

#[test]
fn pin_past_page_count_is_out_of_range() {
    let fixture = fixture_of(1);
    let pool = BufferPool::open(fixture.path()).unwrap();
    let err = pool.pin(pool.page_count()).unwrap_err();
    assert!(matches!(err, BufferPoolError::OutOfRange(_)));
}
