//! Pseudo-random sequence generation.

use std::cmp;

use log;
use rand::distributions::uniform::SampleUniform;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::record::Record;
use crate::sequence::DiskSequence;
use crate::sort::SortError;

/// Default generator seed.
pub const DEFAULT_SEED: u64 = 42;

/// Fills sequences with records drawn uniformly from `[low, high)`. The output only depends on the seed.
pub struct Generator<R: Record + SampleUniform> {
    seed: u64,
    distribution: Uniform<R>,
}

impl<R: Record + SampleUniform> Generator<R> {
    /// Creates a generator.
    ///
    /// # Arguments
    /// * `seed` - Random number generator seed
    /// * `low` - Inclusive lower bound of generated records
    /// * `high` - Exclusive upper bound of generated records
    pub fn new(seed: u64, low: R, high: R) -> Result<Self, SortError> {
        if !R::is_sample_range(&low, &high) {
            return Err(SortError::InvalidConfig("value range is empty or not finite".into()));
        }

        return Ok(Generator {
            seed,
            distribution: Uniform::new(low, high),
        });
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Overwrites every record of the sequence, block by block. A single block buffer is reused:
    /// each block write completes before the buffer is refilled.
    /// Returns the number of generated records.
    pub fn populate(&self, sequence: &mut DiskSequence<R>) -> Result<u64, SortError> {
        // cached blocks would be stale after the overwrite
        sequence.clear_cache()?;

        let store = sequence.store();
        let len = sequence.len();
        let records_per_block = sequence.records_per_block();
        let mut rng = StdRng::seed_from_u64(self.seed);

        log::info!("generating {} records (seed: {})", len, self.seed);
        let mut block = store.new_block()?;
        for index in 0..sequence.block_count() {
            let block_start = index * records_per_block as u64;
            let count = cmp::min(records_per_block as u64, len - block_start) as usize;

            for slot in 0..count {
                self.distribution
                    .sample(&mut rng)
                    .write_to(&mut block[slot * R::SIZE..]);
            }
            block[count * R::SIZE..].fill(0);

            block = store.async_write(index, block).wait()?;
        }

        // the last block is written whole
        sequence.flush()?;

        return Ok(len);
    }
}
