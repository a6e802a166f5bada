//! Block cache with least-recently-used replacement.

use std::collections::{HashMap, VecDeque};

use log;

use crate::buffer::AlignedBlock;
use crate::sort::SortError;
use crate::store::BlockStore;

struct Slot {
    block: AlignedBlock,
    index: Option<u64>,
    dirty: bool,
}

/// Arena of a fixed number of block slots. Tracks block recency explicitly and writes a dirty block
/// back to the store before its slot is reused.
pub struct BlockCache {
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Resident slots, least recently touched first.
    recency: VecDeque<usize>,
    /// Block index to slot.
    resident: HashMap<u64, usize>,
}

impl BlockCache {
    /// Creates an empty cache. Slots are allocated on first use.
    pub fn new(capacity: usize) -> Self {
        BlockCache {
            capacity,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            recency: VecDeque::with_capacity(capacity),
            resident: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.resident.contains_key(&index)
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.resident
            .get(&index)
            .map_or(false, |&slot| self.slots[slot].dirty)
    }

    /// Block indices from the least to the most recently touched.
    pub fn recency(&self) -> Vec<u64> {
        self.recency
            .iter()
            .filter_map(|&slot| self.slots[slot].index)
            .collect()
    }

    /// Returns block `index`, reading it from the store if it is not resident.
    pub fn block(&mut self, store: &BlockStore, index: u64) -> Result<&AlignedBlock, SortError> {
        let slot = self.load(store, index)?;
        Ok(&self.slots[slot].block)
    }

    /// Returns block `index` for modification and marks it dirty.
    pub fn block_mut(&mut self, store: &BlockStore, index: u64) -> Result<&mut AlignedBlock, SortError> {
        let slot = self.load(store, index)?;
        self.slots[slot].dirty = true;
        Ok(&mut self.slots[slot].block)
    }

    /// Evicts the least recently touched block, writing it back first if it is dirty.
    /// Returns the evicted block index or [`None`] if the cache is empty.
    pub fn evict(&mut self, store: &BlockStore) -> Result<Option<u64>, SortError> {
        let slot = match self.recency.front() {
            Some(&slot) => slot,
            None => return Ok(None),
        };
        let index = self.slots[slot].index.expect("resident slot holds a block");

        if self.slots[slot].dirty {
            log::trace!("flushing dirty block {} on eviction", index);
            store.write_block(index, &self.slots[slot].block)?;
            self.slots[slot].dirty = false;
        }

        self.recency.pop_front();
        self.resident.remove(&index);
        self.slots[slot].index = None;
        self.free.push(slot);

        return Ok(Some(index));
    }

    /// Writes every dirty block back to the store. Blocks stay resident.
    pub fn flush(&mut self, store: &BlockStore) -> Result<(), SortError> {
        let mut dirty = Vec::from_iter(
            self.resident
                .iter()
                .filter(|(_, slot)| self.slots[**slot].dirty)
                .map(|(&index, &slot)| (index, slot)),
        );
        dirty.sort_unstable();

        for (index, slot) in dirty {
            store.write_block(index, &self.slots[slot].block)?;
            self.slots[slot].dirty = false;
        }

        return Ok(());
    }

    fn load(&mut self, store: &BlockStore, index: u64) -> Result<usize, SortError> {
        if let Some(&slot) = self.resident.get(&index) {
            self.touch(slot);
            return Ok(slot);
        }

        let slot = self.free_slot(store)?;
        if let Err(err) = store.read_block(index, &mut self.slots[slot].block) {
            self.free.push(slot);
            return Err(err);
        }

        self.slots[slot].index = Some(index);
        self.slots[slot].dirty = false;
        self.resident.insert(index, slot);
        self.recency.push_back(slot);

        return Ok(slot);
    }

    fn free_slot(&mut self, store: &BlockStore) -> Result<usize, SortError> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                block: store.new_block()?,
                index: None,
                dirty: false,
            });
            return Ok(self.slots.len() - 1);
        }

        self.evict(store)?;
        Ok(self.free.pop().expect("eviction releases a slot"))
    }

    fn touch(&mut self, slot: usize) {
        if let Some(position) = self.recency.iter().position(|&s| s == slot) {
            self.recency.remove(position);
        }
        self.recency.push_back(slot);
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::BlockCache;
    use crate::store::test::options;
    use crate::store::BlockStore;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn store_with_blocks(tmp_dir: &tempfile::TempDir, blocks: u8) -> BlockStore {
        let store = BlockStore::create(&tmp_dir.path().join("data.bin"), &options(64)).unwrap();
        for index in 0..blocks {
            let mut block = store.new_block().unwrap();
            block.fill(index);
            store.write_block(index as u64, &block).unwrap();
        }
        store
    }

    #[rstest]
    fn test_capacity_never_exceeded(tmp_dir: tempfile::TempDir) {
        let store = store_with_blocks(&tmp_dir, 10);
        let mut cache = BlockCache::new(3);

        for index in 0..10 {
            let block = cache.block(&store, index).unwrap();
            assert!(block.iter().all(|byte| *byte == index as u8));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.recency(), vec![7, 8, 9]);
    }

    #[rstest]
    fn test_least_recently_touched_evicted(tmp_dir: tempfile::TempDir) {
        let store = store_with_blocks(&tmp_dir, 4);
        let mut cache = BlockCache::new(3);

        for index in 0..3 {
            cache.block(&store, index).unwrap();
        }
        cache.block(&store, 0).unwrap();
        assert_eq!(cache.recency(), vec![1, 2, 0]);

        cache.block(&store, 3).unwrap();
        assert!(!cache.contains(1));
        assert_eq!(cache.recency(), vec![2, 0, 3]);

        let reads = store.stats().snapshot().reads;
        cache.block(&store, 0).unwrap();
        assert_eq!(store.stats().snapshot().reads, reads);
    }

    #[rstest]
    fn test_dirty_block_flushed_on_eviction(tmp_dir: tempfile::TempDir) {
        let store = store_with_blocks(&tmp_dir, 2);
        let mut cache = BlockCache::new(1);

        cache.block_mut(&store, 0).unwrap().fill(42);
        assert!(cache.is_dirty(0));

        let writes = store.stats().snapshot().writes;
        assert_eq!(cache.evict(&store).unwrap(), Some(0));
        assert_eq!(store.stats().snapshot().writes, writes + 1);
        assert!(cache.is_empty());

        // a clean block is dropped without a write
        cache.block(&store, 1).unwrap();
        assert_eq!(cache.evict(&store).unwrap(), Some(1));
        assert_eq!(store.stats().snapshot().writes, writes + 1);
        assert_eq!(cache.evict(&store).unwrap(), None);

        let mut block = store.new_block().unwrap();
        store.read_block(0, &mut block).unwrap();
        assert!(block.iter().all(|byte| *byte == 42));
    }

    #[rstest]
    fn test_flush_keeps_blocks_resident(tmp_dir: tempfile::TempDir) {
        let store = store_with_blocks(&tmp_dir, 3);
        let mut cache = BlockCache::new(4);

        cache.block_mut(&store, 2).unwrap()[0] = 7;
        cache.block_mut(&store, 1).unwrap()[0] = 8;
        cache.flush(&store).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.is_dirty(1) && !cache.is_dirty(2));

        let mut block = store.new_block().unwrap();
        store.read_block(2, &mut block).unwrap();
        assert_eq!(block[0], 7);
        store.read_block(1, &mut block).unwrap();
        assert_eq!(block[0], 8);
    }

    #[rstest]
    fn test_failed_load_releases_slot(tmp_dir: tempfile::TempDir) {
        let store = store_with_blocks(&tmp_dir, 1);
        let mut cache = BlockCache::new(1);

        assert!(cache.block(&store, 5).is_err());
        assert!(cache.is_empty());
        cache.block(&store, 0).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
