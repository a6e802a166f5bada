//! Sorted runs and run formation.

use std::marker::PhantomData;

use log;
use rayon::prelude::*;

use crate::config::SortConfig;
use crate::record::Record;
use crate::sequence::{Scan, SequenceWriter};
use crate::sort::SortError;
use crate::store::BlockStore;

/// Sorted contiguous region of records. Runs always start at a block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Index of the first record.
    pub start: u64,
    /// Number of records.
    pub len: u64,
}

impl Run {
    pub fn new(start: u64, len: u64) -> Self {
        Run { start, len }
    }

    /// Index past the last record.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Splits a sequence into memory-sized chunks, sorts every chunk in memory and writes it back as a run.
pub struct RunSorter<'p, R: Record> {
    /// Records per chunk, a whole number of blocks.
    chunk_records: u64,
    prefetch_blocks: usize,
    /// Sorting thread pool.
    thread_pool: &'p rayon::ThreadPool,

    item_type: PhantomData<R>,
}

impl<'p, R: Record> RunSorter<'p, R> {
    /// Creates a run sorter. Fails if the memory budget cannot hold a single block of records.
    pub fn new(config: &SortConfig, thread_pool: &'p rayon::ThreadPool) -> Result<Self, SortError> {
        return Ok(RunSorter {
            chunk_records: config.chunk_records::<R>()?,
            prefetch_blocks: config.prefetch_blocks,
            thread_pool,
            item_type: PhantomData,
        });
    }

    pub fn chunk_records(&self) -> u64 {
        self.chunk_records
    }

    /// Number of runs produced for `len` records.
    pub fn run_count(&self, len: u64) -> u64 {
        (len + self.chunk_records - 1) / self.chunk_records
    }

    /// Sorts the first `len` records of `input` chunk by chunk. Every sorted chunk is written to
    /// `output` at the offset it was read from. `output` may be `input` itself since a chunk is read
    /// completely before its range is overwritten.
    ///
    /// Loading keeps `prefetch_blocks` reads in flight while the chunk is being filled, saving keeps as
    /// many writes in flight while the next blocks are encoded. Nothing is in flight during the in-memory
    /// sort, and a run is completely written before the next chunk is loaded, so the chunk and at most
    /// [`SortConfig::run_io_blocks`] blocks are allocated at any time.
    /// Returns the runs in source order.
    pub fn produce_runs(&self, input: &BlockStore, len: u64, output: &BlockStore) -> Result<Vec<Run>, SortError> {
        let mut runs = Vec::with_capacity(self.run_count(len) as usize);
        let mut chunk: Vec<R> = Vec::with_capacity(self.chunk_records.min(len) as usize);

        let mut start = 0;
        while start < len {
            let run = Run::new(start, self.chunk_records.min(len - start));

            chunk.clear();
            for record in Scan::new(input, run.start, run.len, self.prefetch_blocks) {
                chunk.push(record?);
            }

            log::debug!("sorting run {} ({} records) ...", runs.len(), run.len);
            // in place, equal records may swap within a run
            self.thread_pool.install(|| {
                chunk.par_sort_unstable_by(|a, b| a.compare(b));
            });

            log::debug!("saving run {}", runs.len());
            let mut writer = SequenceWriter::new(output, run.start, self.prefetch_blocks)?;
            writer.extend_from_slice(&chunk)?;
            writer.finish()?;

            runs.push(run);
            start = run.end();
        }

        log::info!("{} runs of up to {} records created", runs.len(), self.chunk_records);
        return Ok(runs);
    }
}
