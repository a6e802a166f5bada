//! Sorting engine configuration.

use std::path::PathBuf;

use bytesize::{KIB, MIB};

use crate::record::Record;
use crate::sort::SortError;

/// Blocks owned by the merge output writer: one being filled, one being written.
pub const OUTPUT_BLOCKS: u64 = 2;
/// Blocks owned by every merge input: the one being consumed and one prefetched.
pub const BLOCKS_PER_MERGE_INPUT: u64 = 2;

/// Engine configuration. Every field has a documented default, see [`SortConfig::default`].
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// I/O granularity in bytes. Must be a multiple of `alignment` and of the record size.
    pub block_size: usize,
    /// Required buffer and offset alignment of the device.
    pub alignment: usize,
    /// Memory ceiling for run formation and for merge buffers.
    pub memory_budget: u64,
    /// Number of resident blocks of a [`DiskSequence`](crate::DiskSequence) cache.
    pub cache_blocks: usize,
    /// Number of blocks read ahead by sequential scans.
    pub prefetch_blocks: usize,
    /// Number of threads used to sort runs in memory. [`None`] means rayon default.
    pub threads_number: Option<usize>,
    /// Number of threads serving asynchronous block I/O.
    pub io_threads: usize,
    /// Bypass the OS page cache (`O_DIRECT`).
    pub direct_io: bool,
    /// Directory of the scratch file. [`None`] means the directory of the data file.
    pub tmp_dir: Option<PathBuf>,
    /// Check the order first and skip sorting of an already sorted file.
    pub skip_if_sorted: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            block_size: (8 * MIB) as usize,
            alignment: (4 * KIB) as usize,
            memory_budget: 256 * MIB,
            cache_blocks: 8,
            prefetch_blocks: 2,
            threads_number: None,
            io_threads: 2,
            direct_io: true,
            tmp_dir: None,
            skip_if_sorted: true,
        }
    }
}

impl SortConfig {
    /// Checks the configuration is consistent for records of type `R`.
    pub fn validate<R: Record>(&self) -> Result<(), SortError> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(SortError::InvalidConfig(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.block_size == 0 || self.block_size % self.alignment != 0 {
            return Err(SortError::InvalidConfig(format!(
                "block size {} is not a multiple of alignment {}",
                self.block_size, self.alignment
            )));
        }
        if self.block_size % R::SIZE != 0 {
            return Err(SortError::InvalidConfig(format!(
                "block size {} is not a multiple of record size {}",
                self.block_size,
                R::SIZE
            )));
        }
        if self.cache_blocks == 0 {
            return Err(SortError::InvalidConfig("cache must hold at least one block".into()));
        }
        if self.prefetch_blocks == 0 {
            return Err(SortError::InvalidConfig("prefetch depth must be at least one block".into()));
        }
        if self.io_threads == 0 {
            return Err(SortError::InvalidConfig("at least one I/O thread is required".into()));
        }

        return Ok(());
    }

    /// Number of records held by a single block.
    pub fn records_per_block<R: Record>(&self) -> usize {
        self.block_size / R::SIZE
    }

    /// Blocks owned by run formation besides the chunk: the scan filling the chunk, or the writer draining
    /// it, holds the block in use plus `prefetch_blocks` transfers in flight.
    pub fn run_io_blocks(&self) -> u64 {
        self.prefetch_blocks as u64 + 1
    }

    /// Number of records sorted in memory per run. Always a whole number of blocks.
    /// The chunk and the run I/O blocks together stay within the memory budget.
    pub fn chunk_records<R: Record>(&self) -> Result<u64, SortError> {
        let blocks = self.memory_budget / self.block_size as u64;
        let chunk_blocks = blocks.saturating_sub(self.run_io_blocks());
        if chunk_blocks == 0 {
            return Err(SortError::InsufficientMemory {
                budget: self.memory_budget,
                required: (self.run_io_blocks() + 1) * self.block_size as u64,
            });
        }

        return Ok(chunk_blocks * self.records_per_block::<R>() as u64);
    }

    /// Maximal number of runs merged at once within the memory budget.
    pub fn fan_in(&self) -> Result<usize, SortError> {
        let blocks = self.memory_budget / self.block_size as u64;
        let fan_in = blocks.saturating_sub(OUTPUT_BLOCKS) / BLOCKS_PER_MERGE_INPUT;
        if fan_in < 2 {
            return Err(SortError::InsufficientMemory {
                budget: self.memory_budget,
                required: (OUTPUT_BLOCKS + 2 * BLOCKS_PER_MERGE_INPUT) * self.block_size as u64,
            });
        }

        return Ok(fan_in as usize);
    }
}
