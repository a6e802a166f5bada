//! `block-sort` is an out-of-core sort of fixed-size records stored in a single disk file.
//!
//! The file is treated as a flat array of records in native byte order, accessed in aligned blocks.
//! Sorting is achieved in two phases. During the first phase memory-sized chunks are read, sorted in
//! parallel and written back as sorted runs. During the second phase the runs are merged by a bounded-arity
//! merge tree: every pass merges at most `fan-in` runs at once, so any number of runs is handled within
//! the memory budget. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `block-sort` supports the following features:
//!
//! * **Block aligned I/O:**
//!   all transfers are whole aligned blocks, optionally bypassing the page cache (`O_DIRECT`).
//! * **Asynchronous I/O:**
//!   block reads and writes run on a dedicated thread pool and overlap with sorting and merging.
//! * **Random access:**
//!   [`DiskSequence`] provides indexed access to records through an LRU block cache.
//! * **Memory limit support:**
//!   run size and merge fan-in are derived from the configured memory budget.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use bytesize::MIB;
//! use env_logger;
//! use log;
//!
//! use block_sort::{ExternalSorter, ExternalSorterBuilder, Generator};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let sorter: ExternalSorter<f64> = ExternalSorterBuilder::new()
//!         .with_block_size((MIB) as usize)
//!         .with_memory_budget(64 * MIB)
//!         .build()
//!         .unwrap();
//!
//!     let path = Path::new("data.bin");
//!     let generator = Generator::new(42, 0.0, 10000.0).unwrap();
//!     sorter.create_file(path, 10_000_000, &generator).unwrap();
//!
//!     sorter.sort_file(path).unwrap();
//!     assert_eq!(sorter.check_file(path).unwrap(), None);
//! }
//! ```

pub mod buffer;
pub mod cache;
pub mod checker;
pub mod config;
pub mod generator;
pub mod merger;
pub mod record;
pub mod run;
pub mod sequence;
pub mod sort;
pub mod stats;
pub mod store;

pub use buffer::AlignedBlock;
pub use cache::BlockCache;
pub use checker::{first_violation, is_sorted};
pub use config::SortConfig;
pub use generator::Generator;
pub use merger::{BinaryHeapMerger, MergeReport, Merger};
pub use record::Record;
pub use run::{Run, RunSorter};
pub use sequence::{DiskSequence, Scan, SequenceWriter};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortOutcome};
pub use stats::{IoStats, IoStatsSnapshot};
pub use store::{BlockStore, IoRequest, StoreOptions};
