//! Sorted runs merging.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use log;

use crate::config::SortConfig;
use crate::record::Record;
use crate::run::Run;
use crate::sequence::{Scan, SequenceWriter};
use crate::sort::SortError;
use crate::store::BlockStore;

/// Blocks read ahead by every merge input.
const MERGE_PREFETCH_BLOCKS: usize = 1;
/// Block writes kept in flight by the merge output.
const MERGE_WRITE_DEPTH: usize = 1;

struct HeapEntry<R> {
    record: R,
    input: usize,
}

impl<R: Record> Ord for HeapEntry<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .compare(&other.record)
            .then_with(|| self.input.cmp(&other.input))
    }
}

impl<R: Record> PartialOrd for HeapEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Record> PartialEq for HeapEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<R: Record> Eq for HeapEntry<R> {}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of inputs.
///
/// An input supplies its next record only once the previous one has been emitted, so records of the same
/// input never change their relative order. Equal records of different inputs are emitted in input order.
pub struct BinaryHeapMerger<R, E, I>
where
    R: Record,
    I: Iterator<Item = Result<R, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<HeapEntry<R>>>,
    inputs: Vec<I>,
    initiated: bool,

    error_type: PhantomData<E>,
}

impl<R, E, I> BinaryHeapMerger<R, E, I>
where
    R: Record,
    I: Iterator<Item = Result<R, E>>,
{
    /// Creates an instance of a binary heap merger.
    /// Input items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `inputs` - Sorted inputs to be merged in a single sorted one
    pub fn new<T>(inputs: T) -> Self
    where
        T: IntoIterator<Item = I>,
    {
        let inputs = Vec::from_iter(inputs);
        let items = BinaryHeap::with_capacity(inputs.len());

        return BinaryHeapMerger {
            inputs,
            items,
            initiated: false,
            error_type: PhantomData,
        };
    }
}

impl<R, E, I> Iterator for BinaryHeapMerger<R, E, I>
where
    R: Record,
    I: Iterator<Item = Result<R, E>>,
{
    type Item = Result<R, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for (input, items) in self.inputs.iter_mut().enumerate() {
                if let Some(item) = items.next() {
                    match item {
                        Ok(record) => self.items.push(Reverse(HeapEntry { record, input })),
                        Err(err) => return Some(Err(err)),
                    }
                }
            }
        }

        let Reverse(entry) = self.items.pop()?;
        if let Some(item) = self.inputs[entry.input].next() {
            match item {
                Ok(record) => self.items.push(Reverse(HeapEntry {
                    record,
                    input: entry.input,
                })),
                Err(err) => return Some(Err(err)),
            }
        }

        return Some(Ok(entry.record));
    }
}

/// Summary of a completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Number of merge passes performed.
    pub passes: usize,
    /// Resulting run, [`None`] if there was nothing to merge.
    pub run: Option<Run>,
}

/// Multi-pass merger. Every pass merges groups of at most `fan_in` consecutive runs into one run,
/// alternating between the data file and the scratch file, until a single run is left in the data file.
pub struct Merger<R: Record> {
    fan_in: usize,

    item_type: PhantomData<R>,
}

impl<R: Record> Merger<R> {
    /// Creates a merger whose fan-in fits the memory budget: every input run owns a block being
    /// consumed and a prefetched one, the output owns a block being filled and one being written.
    pub fn new(config: &SortConfig) -> Result<Self, SortError> {
        return Ok(Merger {
            fan_in: config.fan_in()?,
            item_type: PhantomData,
        });
    }

    /// Maximal number of runs merged at once.
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Number of passes needed to merge `runs` runs into one.
    pub fn passes_needed(&self, runs: usize) -> usize {
        let mut runs = runs;
        let mut passes = 0;
        while runs > 1 {
            runs = (runs + self.fan_in - 1) / self.fan_in;
            passes += 1;
        }

        return passes;
    }

    /// Whether runs must be placed in the scratch file so that the last pass writes into the data file.
    pub fn runs_in_scratch(&self, runs: usize) -> bool {
        self.passes_needed(runs) % 2 == 1
    }

    /// Merges contiguous runs into a single run stored in `data`.
    /// Runs are expected in `scratch` if [`Merger::runs_in_scratch`] holds, in `data` otherwise.
    pub fn merge(&self, runs: Vec<Run>, data: &BlockStore, scratch: &BlockStore) -> Result<MergeReport, SortError> {
        if runs.windows(2).any(|pair| pair[0].end() != pair[1].start) {
            return Err(SortError::InvalidConfig("merged runs must be contiguous".into()));
        }

        let passes = self.passes_needed(runs.len());
        let (mut source, mut target) = if passes % 2 == 1 {
            (scratch, data)
        } else {
            (data, scratch)
        };

        let mut runs = runs;
        for pass in 0..passes {
            log::info!("merge pass {}/{} ({} runs, fan-in {})", pass + 1, passes, runs.len(), self.fan_in);
            runs = self.merge_pass(&runs, source, target)?;
            std::mem::swap(&mut source, &mut target);
        }

        return Ok(MergeReport {
            passes,
            run: runs.first().copied(),
        });
    }

    /// Merges groups of at most `fan_in` consecutive runs of `source` into runs of `target`.
    pub fn merge_pass(&self, runs: &[Run], source: &BlockStore, target: &BlockStore) -> Result<Vec<Run>, SortError> {
        runs.chunks(self.fan_in)
            .map(|group| self.merge_group(group, source, target))
            .collect()
    }

    /// Merges consecutive runs of `source` into one run of `target` placed at the first run's offset.
    pub fn merge_group(&self, group: &[Run], source: &BlockStore, target: &BlockStore) -> Result<Run, SortError> {
        let merged = match group.first() {
            Some(first) => Run::new(first.start, group.iter().map(|run| run.len).sum()),
            None => return Err(SortError::InvalidConfig("empty merge group".into())),
        };
        log::debug!(
            "merging {} runs into records {}..{}",
            group.len(),
            merged.start,
            merged.end()
        );

        let inputs = group
            .iter()
            .map(|run| Scan::<R>::new(source, run.start, run.len, MERGE_PREFETCH_BLOCKS));
        let mut writer = SequenceWriter::new(target, merged.start, MERGE_WRITE_DEPTH)?;

        for record in BinaryHeapMerger::new(inputs) {
            writer.push(record?)?;
        }
        writer.finish()?;

        return Ok(merged);
    }
}
