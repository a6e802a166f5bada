//! Disk sequence: a logical array of fixed-size records stored in a [`BlockStore`].
//!
//! Record `i` always lives at byte offset `i * R::SIZE`; blocks only matter for caching and I/O.
//! Random access goes through a [`BlockCache`]. Sequential access uses [`Scan`] and
//! [`SequenceWriter`], which keep a bounded number of block transfers in flight so that I/O
//! overlaps with the caller's computation.

use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;

use log;

use crate::buffer::AlignedBlock;
use crate::cache::BlockCache;
use crate::record::Record;
use crate::sort::SortError;
use crate::store::{BlockStore, IoRequest};

/// Default number of blocks read ahead by a sequence scan.
pub const DEFAULT_PREFETCH_BLOCKS: usize = 2;

/// Random access view of the records of a block store.
pub struct DiskSequence<'a, R: Record> {
    store: &'a BlockStore,
    len: u64,
    records_per_block: usize,
    prefetch_blocks: usize,
    cache: BlockCache,
    /// Set by [`DiskSequence::set`], cleared by [`DiskSequence::flush`].
    modified: bool,

    item_type: PhantomData<R>,
}

impl<'a, R: Record> DiskSequence<'a, R> {
    /// Opens the sequence stored in `store`. The record count is implied by the file size.
    ///
    /// # Arguments
    /// * `store` - Block store holding the records
    /// * `cache_blocks` - Number of resident blocks kept by the cache
    pub fn open(store: &'a BlockStore, cache_blocks: usize) -> Result<Self, SortError> {
        if store.block_size() % R::SIZE != 0 {
            return Err(SortError::InvalidConfig(format!(
                "block size {} is not a multiple of record size {}",
                store.block_size(),
                R::SIZE
            )));
        }
        if cache_blocks == 0 {
            return Err(SortError::InvalidConfig("cache must hold at least one block".into()));
        }

        let len_bytes = store.len_bytes();
        if len_bytes % R::SIZE as u64 != 0 {
            return Err(SortError::IO(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "file size {} is not a multiple of record size {}",
                    len_bytes,
                    R::SIZE
                ),
            )));
        }

        return Ok(DiskSequence {
            store,
            len: len_bytes / R::SIZE as u64,
            records_per_block: store.block_size() / R::SIZE,
            prefetch_blocks: DEFAULT_PREFETCH_BLOCKS,
            cache: BlockCache::new(cache_blocks),
            modified: false,
            item_type: PhantomData,
        });
    }

    /// Resizes the store to hold exactly `len` records and opens it as a sequence.
    pub fn create(store: &'a BlockStore, len: u64, cache_blocks: usize) -> Result<Self, SortError> {
        store.set_len(len * R::SIZE as u64)?;
        Self::open(store, cache_blocks)
    }

    /// Sets the number of blocks read ahead by sequential scans.
    pub fn with_prefetch(mut self, prefetch_blocks: usize) -> Self {
        self.prefetch_blocks = prefetch_blocks.max(1);
        return self;
    }

    pub fn store(&self) -> &'a BlockStore {
        self.store
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn records_per_block(&self) -> usize {
        self.records_per_block
    }

    /// Number of blocks spanned by the sequence.
    pub fn block_count(&self) -> u64 {
        (self.len + self.records_per_block as u64 - 1) / self.records_per_block as u64
    }

    /// Returns the record at `index`.
    pub fn get(&mut self, index: u64) -> Result<R, SortError> {
        self.check_index(index)?;
        let (block_index, offset) = self.locate(index);

        let block = self.cache.block(self.store, block_index)?;
        return Ok(R::read_from(&block[offset..]));
    }

    /// Replaces the record at `index`. The change reaches the disk on eviction or flush.
    pub fn set(&mut self, index: u64, record: R) -> Result<(), SortError> {
        self.check_index(index)?;
        let (block_index, offset) = self.locate(index);

        let block = self.cache.block_mut(self.store, block_index)?;
        record.write_to(&mut block[offset..]);
        self.modified = true;

        return Ok(());
    }

    /// Writes dirty cached blocks back and restores the exact file length.
    pub fn flush(&mut self) -> Result<(), SortError> {
        self.cache.flush(self.store)?;

        // whole-block writes may have extended the file past the last record
        let len_bytes = self.len * R::SIZE as u64;
        if self.store.len_bytes() != len_bytes {
            self.store.set_len(len_bytes)?;
        }
        self.modified = false;

        return Ok(());
    }

    /// Flushes and then drops every cached block.
    pub fn clear_cache(&mut self) -> Result<(), SortError> {
        self.flush()?;
        while self.cache.evict(self.store)?.is_some() {}

        return Ok(());
    }

    /// Scans `block_count` blocks starting at `start_block`, clipped to the sequence end.
    /// Dirty cached blocks are flushed first. The scan can be restarted by calling this method again.
    pub fn sequential_scan(&mut self, start_block: u64, block_count: u64) -> Result<Scan<'a, R>, SortError> {
        if self.modified {
            self.flush()?;
        }

        let per_block = self.records_per_block as u64;
        let start = start_block.saturating_mul(per_block).min(self.len);
        let end = start_block
            .saturating_add(block_count)
            .saturating_mul(per_block)
            .min(self.len);

        return Ok(Scan::new(self.store, start, end - start, self.prefetch_blocks));
    }

    /// Scans the whole sequence.
    pub fn iter(&mut self) -> Result<Scan<'a, R>, SortError> {
        let block_count = self.block_count();
        self.sequential_scan(0, block_count)
    }

    fn check_index(&self, index: u64) -> Result<(), SortError> {
        if index >= self.len {
            return Err(SortError::IO(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record {} is out of range (sequence holds {} records)", index, self.len),
            )));
        }

        return Ok(());
    }

    fn locate(&self, index: u64) -> (u64, usize) {
        let per_block = self.records_per_block as u64;
        (index / per_block, (index % per_block) as usize * R::SIZE)
    }
}

impl<'a, R: Record> Drop for DiskSequence<'a, R> {
    fn drop(&mut self) {
        if self.modified {
            if let Err(err) = self.flush() {
                log::error!("disk sequence flushing error: {}", err);
            }
        }
    }
}

/// Forward scan over a record range of a block store. Keeps up to `prefetch` block reads in flight
/// while the caller consumes the current block.
pub struct Scan<'a, R: Record> {
    store: &'a BlockStore,
    records_per_block: u64,
    start: u64,
    end: u64,
    next_block: u64,
    end_block: u64,
    /// Block buffers owned by the scan: the current one plus the prefetched ones.
    buffers: usize,
    spare: Vec<AlignedBlock>,
    pending: VecDeque<IoRequest>,
    current: Option<AlignedBlock>,
    pos: usize,
    avail: usize,
    failed: bool,

    item_type: PhantomData<R>,
}

impl<'a, R: Record> Scan<'a, R> {
    /// Creates a scan of `len` records starting at record `start`.
    ///
    /// # Arguments
    /// * `store` - Block store to read from
    /// * `start` - Index of the first record
    /// * `len` - Number of records
    /// * `prefetch` - Number of block reads kept in flight
    pub fn new(store: &'a BlockStore, start: u64, len: u64, prefetch: usize) -> Self {
        let records_per_block = (store.block_size() / R::SIZE) as u64;
        let end = start + len;

        Scan {
            store,
            records_per_block,
            start,
            end,
            next_block: start / records_per_block,
            end_block: (end + records_per_block - 1) / records_per_block,
            buffers: prefetch.max(1) + 1,
            spare: Vec::new(),
            pending: VecDeque::new(),
            current: None,
            pos: 0,
            avail: 0,
            failed: false,
            item_type: PhantomData,
        }
    }

    fn issue(&mut self) -> Result<(), SortError> {
        while self.next_block < self.end_block && self.pending.len() < self.buffers {
            let block = match self.spare.pop() {
                Some(block) => block,
                None => self.store.new_block()?,
            };
            self.pending.push_back(self.store.async_read(self.next_block, block));
            self.next_block += 1;
        }

        return Ok(());
    }

    fn fail(&mut self, err: SortError) -> Option<Result<R, SortError>> {
        self.failed = true;
        // in-flight reads release their buffers on completion
        self.pending.clear();
        Some(Err(err))
    }
}

impl<'a, R: Record> Iterator for Scan<'a, R> {
    type Item = Result<R, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(block) = &self.current {
                if self.pos < self.avail {
                    let offset = self.pos * R::SIZE;
                    self.pos += 1;
                    return Some(Ok(R::read_from(&block[offset..])));
                }
            }

            if let Some(block) = self.current.take() {
                self.spare.push(block);
            }
            if let Err(err) = self.issue() {
                return self.fail(err);
            }

            let request = self.pending.pop_front()?;
            let block_start = request.index() * self.records_per_block;
            match request.wait() {
                Ok(block) => {
                    self.pos = (self.start.max(block_start) - block_start) as usize;
                    self.avail = (self.end.min(block_start + self.records_per_block) - block_start) as usize;
                    self.current = Some(block);
                }
                Err(err) => return self.fail(err),
            }
        }
    }
}

/// Sequential writer of records starting at a block boundary. A full block is written
/// asynchronously while the next one is being filled; at most `depth` writes are in flight.
pub struct SequenceWriter<'a, R: Record> {
    store: &'a BlockStore,
    records_per_block: usize,
    next_block: u64,
    buffers: usize,
    allocated: usize,
    current: AlignedBlock,
    fill: usize,
    spare: Vec<AlignedBlock>,
    in_flight: VecDeque<IoRequest>,
    written: u64,

    item_type: PhantomData<R>,
}

impl<'a, R: Record> SequenceWriter<'a, R> {
    /// Creates a writer positioned at record `start`, which must be the first record of a block.
    ///
    /// # Arguments
    /// * `store` - Block store to write to
    /// * `start` - Index of the first record to be written
    /// * `depth` - Number of block writes kept in flight
    pub fn new(store: &'a BlockStore, start: u64, depth: usize) -> Result<Self, SortError> {
        let records_per_block = store.block_size() / R::SIZE;
        if start % records_per_block as u64 != 0 {
            return Err(SortError::Alignment {
                address: (start * R::SIZE as u64) as usize,
                len: store.block_size(),
                alignment: store.block_size(),
            });
        }

        return Ok(SequenceWriter {
            store,
            records_per_block,
            next_block: start / records_per_block as u64,
            buffers: depth.max(1) + 1,
            allocated: 1,
            current: store.new_block()?,
            fill: 0,
            spare: Vec::new(),
            in_flight: VecDeque::new(),
            written: 0,
            item_type: PhantomData,
        });
    }

    /// Appends a record.
    pub fn push(&mut self, record: R) -> Result<(), SortError> {
        record.write_to(&mut self.current[self.fill * R::SIZE..]);
        self.fill += 1;
        self.written += 1;

        if self.fill == self.records_per_block {
            self.flush_current()?;
        }

        return Ok(());
    }

    /// Appends all records of a slice.
    pub fn extend_from_slice(&mut self, records: &[R]) -> Result<(), SortError> {
        for record in records {
            self.push(*record)?;
        }

        return Ok(());
    }

    /// Writes the partially filled block, zero padded, and waits for all writes to complete.
    /// Returns the number of records written.
    pub fn finish(self) -> Result<u64, SortError> {
        let SequenceWriter {
            store,
            next_block,
            mut current,
            fill,
            mut in_flight,
            written,
            ..
        } = self;

        if fill > 0 {
            current[fill * R::SIZE..].fill(0);
            in_flight.push_back(store.async_write(next_block, current));
        }
        for request in in_flight {
            request.wait()?;
        }

        return Ok(written);
    }

    fn flush_current(&mut self) -> Result<(), SortError> {
        let next = self.take_buffer()?;
        let full = std::mem::replace(&mut self.current, next);

        self.in_flight.push_back(self.store.async_write(self.next_block, full));
        self.next_block += 1;
        self.fill = 0;

        return Ok(());
    }

    fn take_buffer(&mut self) -> Result<AlignedBlock, SortError> {
        if let Some(block) = self.spare.pop() {
            return Ok(block);
        }
        if self.allocated < self.buffers {
            self.allocated += 1;
            return self.store.new_block();
        }

        match self.in_flight.pop_front() {
            Some(request) => request.wait(),
            None => self.store.new_block(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    use super::{DiskSequence, Scan, SequenceWriter};
    use crate::sort::SortError;
    use crate::store::test::options;
    use crate::store::BlockStore;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_values(tmp_dir: &tempfile::TempDir, values: &[f64]) -> BlockStore {
        let path = tmp_dir.path().join("data.bin");
        let bytes = Vec::from_iter(values.iter().flat_map(|value| value.to_ne_bytes()));
        fs::write(&path, bytes).unwrap();
        BlockStore::open(&path, &options(64)).unwrap()
    }

    #[rstest]
    fn test_random_access(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.bin");
        let store = BlockStore::create(&path, &options(64)).unwrap();

        let mut sequence: DiskSequence<f64> = DiskSequence::create(&store, 21, 2).unwrap();
        assert_eq!(sequence.len(), 21);
        assert_eq!(sequence.block_count(), 3);

        for index in (0..21).rev() {
            sequence.set(index, index as f64 * 1.5).unwrap();
        }
        for index in 0..21 {
            assert_eq!(sequence.get(index).unwrap(), index as f64 * 1.5);
        }
        drop(sequence);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 21 * 8);
        assert_eq!(&bytes[20 * 8..], &30.0f64.to_ne_bytes());
    }

    #[rstest]
    fn test_out_of_range_access(tmp_dir: tempfile::TempDir) {
        let store = write_values(&tmp_dir, &[1.0, 2.0]);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap();

        match sequence.get(2) {
            Err(SortError::IO(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(sequence.set(7, 0.0).is_err());
    }

    #[rstest]
    fn test_truncated_record(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.bin");
        fs::write(&path, vec![0u8; 12]).unwrap();
        let store = BlockStore::open(&path, &options(64)).unwrap();

        match DiskSequence::<f64>::open(&store, 8) {
            Err(SortError::IO(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidData),
            _ => panic!("truncated record accepted"),
        };
    }

    #[rstest]
    #[case(0, 10, 0..21)]
    #[case(1, 1, 8..16)]
    #[case(2, 5, 16..21)]
    #[case(3, 1, 21..21)]
    fn test_sequential_scan(
        tmp_dir: tempfile::TempDir,
        #[case] start_block: u64,
        #[case] block_count: u64,
        #[case] expected: std::ops::Range<usize>,
    ) {
        let values = Vec::from_iter((0..21).map(|value| value as f64));
        let store = write_values(&tmp_dir, &values);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap().with_prefetch(1);

        let scanned: Result<Vec<f64>, _> = sequence.sequential_scan(start_block, block_count).unwrap().collect();
        assert_eq!(scanned.unwrap(), values[expected.clone()].to_vec());

        // restartable
        let rescanned: Result<Vec<f64>, _> = sequence.sequential_scan(start_block, block_count).unwrap().collect();
        assert_eq!(rescanned.unwrap(), values[expected].to_vec());
    }

    #[rstest]
    fn test_scan_sees_cached_writes(tmp_dir: tempfile::TempDir) {
        let store = write_values(&tmp_dir, &[1.0, 2.0, 3.0]);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap();

        sequence.set(1, 20.0).unwrap();
        let scanned: Result<Vec<f64>, _> = sequence.iter().unwrap().collect();
        assert_eq!(scanned.unwrap(), vec![1.0, 20.0, 3.0]);
        assert_eq!(store.len_bytes(), 24);
    }

    #[rstest]
    #[case(3, 11)]
    #[case(8, 8)]
    #[case(0, 0)]
    #[case(20, 1)]
    fn test_unaligned_scan(tmp_dir: tempfile::TempDir, #[case] start: u64, #[case] len: u64) {
        let values = Vec::from_iter((0..21).map(|value| value as f64));
        let store = write_values(&tmp_dir, &values);

        let scanned: Result<Vec<f64>, _> = Scan::new(&store, start, len, 3).collect();
        let expected = &values[start as usize..(start + len) as usize];
        assert_eq!(scanned.unwrap(), expected.to_vec());
    }

    #[rstest]
    fn test_scan_error_is_terminal(tmp_dir: tempfile::TempDir) {
        let store = write_values(&tmp_dir, &[1.0; 10]);

        let mut scan: Scan<f64> = Scan::new(&store, 0, 40, 2);
        // the second block is partial and zero padded, the third one is past the end of file
        let results = Vec::from_iter(scan.by_ref().take(16));
        assert!(results.iter().all(|result| result.is_ok()));

        assert!(matches!(scan.next(), Some(Err(SortError::IO(_)))));
        assert!(scan.next().is_none());
    }

    #[rstest]
    #[case(0, 21)]
    #[case(8, 16)]
    #[case(16, 3)]
    fn test_sequence_writer(tmp_dir: tempfile::TempDir, #[case] start: u64, #[case] count: u64) {
        let store = BlockStore::create(&tmp_dir.path().join("data.bin"), &options(64)).unwrap();

        let mut writer: SequenceWriter<f64> = SequenceWriter::new(&store, start, 1).unwrap();
        for value in 0..count {
            writer.push(value as f64).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), count);

        let written: Result<Vec<f64>, _> = Scan::new(&store, start, count, 2).collect();
        assert_eq!(written.unwrap(), Vec::from_iter((0..count).map(|value| value as f64)));

        // partial last block is written whole and zero padded
        let pad = (8 - (start + count) % 8) % 8;
        let padded: Result<Vec<f64>, _> = Scan::new(&store, start + count, pad, 1).collect();
        assert!(padded.unwrap().iter().all(|value| *value == 0.0));
    }

    #[rstest]
    fn test_misaligned_writer(tmp_dir: tempfile::TempDir) {
        let store = BlockStore::create(&tmp_dir.path().join("data.bin"), &options(64)).unwrap();
        assert!(matches!(
            SequenceWriter::<f64>::new(&store, 3, 1),
            Err(SortError::Alignment { .. })
        ));
    }
}
