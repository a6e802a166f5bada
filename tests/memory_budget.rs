//! Heap usage of a sort measured with a counting global allocator.
//!
//! The allocator is process wide, so everything runs in a single test.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use block_sort::{BlockStore, ExternalSorter, ExternalSorterBuilder, Generator, Merger, RunSorter, SortConfig};

/// Aligned blocks are the only allocations with a page alignment.
const BLOCK_ALIGNMENT: usize = 4096;
const BLOCK_SIZE: usize = 64 * 1024;
/// 16 blocks plus half a block for bookkeeping (channels, queues, run lists).
const MEMORY_BUDGET: u64 = 16 * BLOCK_SIZE as u64 + BLOCK_SIZE as u64 / 2;
const RECORDS: u64 = 2_000_000;

struct Counter {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Counter {
    const fn new() -> Self {
        Counter {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn add(&self, size: usize) {
        let current = self.current.fetch_add(size, Ordering::SeqCst) + size;
        self.peak.fetch_max(current, Ordering::SeqCst);
    }

    fn sub(&self, size: usize) {
        self.current.fetch_sub(size, Ordering::SeqCst);
    }

    /// Restarts peak tracking and returns the current usage.
    fn reset(&self) -> usize {
        let current = self.current.load(Ordering::SeqCst);
        self.peak.store(current, Ordering::SeqCst);
        current
    }

    fn peak_since(&self, baseline: usize) -> usize {
        self.peak.load(Ordering::SeqCst).saturating_sub(baseline)
    }
}

static HEAP: Counter = Counter::new();
static BLOCKS: Counter = Counter::new();

struct CountingAllocator;

impl CountingAllocator {
    fn on_alloc(layout: Layout) {
        HEAP.add(layout.size());
        if layout.align() >= BLOCK_ALIGNMENT {
            BLOCKS.add(layout.size());
        }
    }

    fn on_dealloc(layout: Layout) {
        HEAP.sub(layout.size());
        if layout.align() >= BLOCK_ALIGNMENT {
            BLOCKS.sub(layout.size());
        }
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::on_alloc(layout);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::on_alloc(layout);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        Self::on_dealloc(layout);
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

struct Usage {
    heap: usize,
    blocks: usize,
}

fn measure<T>(f: impl FnOnce() -> T) -> (T, Usage) {
    let heap = HEAP.reset();
    let blocks = BLOCKS.reset();
    let result = f();

    let usage = Usage {
        heap: HEAP.peak_since(heap),
        blocks: BLOCKS.peak_since(blocks),
    };
    (result, usage)
}

fn config() -> SortConfig {
    SortConfig {
        block_size: BLOCK_SIZE,
        alignment: BLOCK_ALIGNMENT,
        memory_budget: MEMORY_BUDGET,
        threads_number: Some(2),
        direct_io: false,
        ..SortConfig::default()
    }
}

#[test]
fn test_memory_budget() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("data.bin");
    let config = config();

    let sorter: ExternalSorter<f64> = ExternalSorterBuilder::new().with_config(config.clone()).build().unwrap();
    let generator = Generator::new(42, 0.0, 10000.0).unwrap();
    sorter.create_file(&path, RECORDS, &generator).unwrap();

    // run formation and merging, step by step
    let thread_pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let run_sorter: RunSorter<f64> = RunSorter::new(&config, &thread_pool).unwrap();
    let merger: Merger<f64> = Merger::new(&config).unwrap();
    assert_eq!(merger.fan_in(), 7);

    let data = BlockStore::open(&path, &sorter.store_options()).unwrap();
    let scratch = BlockStore::scratch(tmp_dir.path(), &sorter.store_options()).unwrap();
    let run_count = run_sorter.run_count(RECORDS) as usize;
    assert_eq!(run_count, 19);
    let runs_store = if merger.runs_in_scratch(run_count) { &scratch } else { &data };

    let (runs, usage) = measure(|| run_sorter.produce_runs(&data, RECORDS, runs_store).unwrap());
    assert!(
        usage.heap as u64 <= MEMORY_BUDGET,
        "run formation used {} bytes, budget is {}",
        usage.heap,
        MEMORY_BUDGET
    );
    assert!(usage.blocks as u64 <= config.run_io_blocks() * BLOCK_SIZE as u64);

    let (report, usage) = measure(|| merger.merge(runs, &data, &scratch).unwrap());
    assert_eq!(report.passes, 2);
    assert!(
        usage.heap as u64 <= MEMORY_BUDGET,
        "merging used {} bytes, budget is {}",
        usage.heap,
        MEMORY_BUDGET
    );
    assert!(usage.blocks <= (2 * merger.fan_in() + 2) * BLOCK_SIZE);

    data.set_len(RECORDS * 8).unwrap();
    drop(scratch);
    drop(data);
    assert_eq!(sorter.check_file(&path).unwrap(), None);

    // the whole sort, order check included
    sorter.create_file(&path, RECORDS, &generator).unwrap();
    let (_, usage) = measure(|| sorter.sort_file(&path).unwrap());
    assert!(
        usage.heap as u64 <= MEMORY_BUDGET,
        "sorting used {} bytes, budget is {}",
        usage.heap,
        MEMORY_BUDGET
    );
    assert_eq!(sorter.check_file(&path).unwrap(), None);
}
