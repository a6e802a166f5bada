//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::distributions::uniform::SampleUniform;

use crate::checker;
use crate::config::SortConfig;
use crate::generator::Generator;
use crate::merger::{MergeReport, Merger};
use crate::record::Record;
use crate::run::RunSorter;
use crate::sequence::DiskSequence;
use crate::stats::IoStats;
use crate::store::{BlockStore, StoreOptions};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Scratch file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Device read, write or open error.
    IO(io::Error),
    /// Buffer or offset does not match the device alignment.
    Alignment { address: usize, len: usize, alignment: usize },
    /// Memory budget too small to make progress.
    InsufficientMemory { budget: u64, required: u64 },
    /// Inconsistent configuration.
    InvalidConfig(String),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Alignment { .. } => None,
            SortError::InsufficientMemory { .. } => None,
            SortError::InvalidConfig(_) => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "scratch file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Alignment {
                address,
                len,
                alignment,
            } => write!(
                f,
                "buffer or offset {:#x} (length {}) does not match the device alignment {}",
                address, len, alignment
            ),
            SortError::InsufficientMemory { budget, required } => write!(
                f,
                "memory budget of {} bytes is too small, at least {} bytes are required",
                budget, required
            ),
            SortError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

/// Result of a sort operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOutcome {
    /// The sequence was found sorted and left untouched.
    AlreadySorted,
    /// The sequence has been sorted.
    Sorted {
        /// Number of sorted records.
        records: u64,
        /// Number of runs created.
        runs: usize,
        /// Number of merge passes.
        passes: usize,
    },
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<R: Record> {
    config: SortConfig,

    /// Record type.
    item_type: PhantomData<R>,
}

impl<R: Record> ExternalSorterBuilder<R> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<R>, SortError> {
        ExternalSorter::new(self.config)
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: SortConfig) -> ExternalSorterBuilder<R> {
        self.config = config;
        return self;
    }

    /// Sets I/O block size in bytes.
    pub fn with_block_size(mut self, block_size: usize) -> ExternalSorterBuilder<R> {
        self.config.block_size = block_size;
        return self;
    }

    /// Sets buffer alignment required by the device.
    pub fn with_alignment(mut self, alignment: usize) -> ExternalSorterBuilder<R> {
        self.config.alignment = alignment;
        return self;
    }

    /// Sets memory budget in bytes.
    pub fn with_memory_budget(mut self, memory_budget: u64) -> ExternalSorterBuilder<R> {
        self.config.memory_budget = memory_budget;
        return self;
    }

    /// Sets number of blocks cached by random access sequences.
    pub fn with_cache_blocks(mut self, cache_blocks: usize) -> ExternalSorterBuilder<R> {
        self.config.cache_blocks = cache_blocks;
        return self;
    }

    /// Sets number of blocks read ahead by sequential scans.
    pub fn with_prefetch_blocks(mut self, prefetch_blocks: usize) -> ExternalSorterBuilder<R> {
        self.config.prefetch_blocks = prefetch_blocks;
        return self;
    }

    /// Sets number of threads to be used to sort runs in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<R> {
        self.config.threads_number = Some(threads_number);
        return self;
    }

    /// Sets number of threads serving asynchronous I/O.
    pub fn with_io_threads(mut self, io_threads: usize) -> ExternalSorterBuilder<R> {
        self.config.io_threads = io_threads;
        return self;
    }

    /// Enables or disables direct (unbuffered) I/O.
    pub fn with_direct_io(mut self, direct_io: bool) -> ExternalSorterBuilder<R> {
        self.config.direct_io = direct_io;
        return self;
    }

    /// Sets directory to be used to store the scratch file.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<R> {
        self.config.tmp_dir = Some(path.into());
        return self;
    }

    /// Enables or disables skipping the sort of an already sorted sequence.
    pub fn with_skip_if_sorted(mut self, skip_if_sorted: bool) -> ExternalSorterBuilder<R> {
        self.config.skip_if_sorted = skip_if_sorted;
        return self;
    }
}

impl<R: Record> Default for ExternalSorterBuilder<R> {
    fn default() -> Self {
        ExternalSorterBuilder {
            config: SortConfig::default(),
            item_type: PhantomData,
        }
    }
}

/// External sorter.
pub struct ExternalSorter<R: Record> {
    config: SortConfig,
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Asynchronous I/O thread pool.
    io_pool: Arc<rayon::ThreadPool>,
    /// I/O counters of every store opened by the sorter.
    stats: Arc<IoStats>,

    /// Record type.
    item_type: PhantomData<R>,
}

impl<R: Record> ExternalSorter<R> {
    /// Creates a new external sorter instance.
    /// The configuration is fully validated here, before any file is touched.
    pub fn new(config: SortConfig) -> Result<Self, SortError> {
        config.validate::<R>()?;
        config.chunk_records::<R>()?;
        config.fan_in()?;

        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(config.threads_number)?,
            io_pool: Arc::new(Self::init_io_pool(config.io_threads)?),
            stats: Arc::new(IoStats::new()),
            config,
            item_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_io_pool(io_threads: usize) -> Result<rayon::ThreadPool, SortError> {
        log::debug!("initializing I/O thread-pool (threads: {})", io_threads);

        rayon::ThreadPoolBuilder::new()
            .num_threads(io_threads)
            .thread_name(|index| format!("block-io-{}", index))
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// I/O counters accumulated by all stores opened through this sorter.
    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    /// Block store parameters derived from the sorter configuration.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::new(&self.config, Arc::clone(&self.io_pool), Arc::clone(&self.stats))
    }

    /// Creates or truncates the file at `path` and fills it with `records` generated records.
    pub fn create_file(&self, path: &Path, records: u64, generator: &Generator<R>) -> Result<u64, SortError>
    where
        R: SampleUniform,
    {
        let store = BlockStore::create(path, &self.store_options())?;
        let mut sequence: DiskSequence<R> = DiskSequence::create(&store, records, self.config.cache_blocks)?;

        generator.populate(&mut sequence)
    }

    /// Scans the file at `path` and returns the index of the first out-of-order record, if any.
    pub fn check_file(&self, path: &Path) -> Result<Option<u64>, SortError> {
        let store = BlockStore::open(path, &self.store_options())?;
        let mut sequence: DiskSequence<R> =
            DiskSequence::open(&store, self.config.cache_blocks)?.with_prefetch(self.config.prefetch_blocks);

        log::info!("checking order of {} records ...", sequence.len());
        checker::first_violation(&mut sequence)
    }

    /// Sorts the file at `path` in place.
    pub fn sort_file(&self, path: &Path) -> Result<SortOutcome, SortError> {
        let data = BlockStore::open(path, &self.store_options())?;
        let scratch_dir = self.scratch_dir(path);

        self.sort(&data, &scratch_dir)
    }

    /// Sorts the records of `data` in place. The scratch file, if needed, is created in `scratch_dir`.
    pub fn sort(&self, data: &BlockStore, scratch_dir: &Path) -> Result<SortOutcome, SortError> {
        let len = {
            let mut sequence: DiskSequence<R> =
                DiskSequence::open(data, self.config.cache_blocks)?.with_prefetch(self.config.prefetch_blocks);
            log::info!("sequence size: {} records", sequence.len());

            if sequence.len() <= 1 {
                return Ok(SortOutcome::AlreadySorted);
            }
            if self.config.skip_if_sorted {
                log::info!("checking order ...");
                if checker::is_sorted(&mut sequence)? {
                    log::info!("already sorted");
                    return Ok(SortOutcome::AlreadySorted);
                }
            }
            sequence.len()
        };

        let run_sorter: RunSorter<R> = RunSorter::new(&self.config, &self.thread_pool)?;
        let merger: Merger<R> = Merger::new(&self.config)?;

        let run_count = run_sorter.run_count(len) as usize;
        let passes = merger.passes_needed(run_count);
        log::info!(
            "sorting {} records: {} runs, {} merge passes",
            len,
            run_count,
            passes
        );

        let scratch = if passes > 0 {
            Some(BlockStore::scratch(scratch_dir, &self.store_options())?)
        } else {
            None
        };
        let runs_store = match &scratch {
            Some(scratch) if merger.runs_in_scratch(run_count) => scratch,
            _ => data,
        };

        let runs = run_sorter.produce_runs(data, len, runs_store)?;
        let report = match &scratch {
            Some(scratch) => merger.merge(runs, data, scratch)?,
            None => MergeReport {
                passes: 0,
                run: runs.first().copied(),
            },
        };

        // whole-block writes may have extended the file past the last record
        data.set_len(len * R::SIZE as u64)?;
        log::info!("external sort done");

        return Ok(SortOutcome::Sorted {
            records: len,
            runs: run_count,
            passes: report.passes,
        });
    }

    fn scratch_dir(&self, path: &Path) -> PathBuf {
        if let Some(tmp_dir) = &self.config.tmp_dir {
            return tmp_dir.clone();
        }

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}
