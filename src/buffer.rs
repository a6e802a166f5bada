//! Aligned block buffers.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::sort::SortError;

/// Heap allocated, zero-initialized byte buffer whose address is a multiple of the requested alignment.
/// A block is the unit of every transfer between memory and a [`BlockStore`](crate::BlockStore).
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// the buffer is exclusively owned, so it can be handed over to an I/O thread
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

impl AlignedBlock {
    /// Allocates a zeroed block.
    ///
    /// # Arguments
    /// * `size` - Block size in bytes, must be positive
    /// * `alignment` - Address alignment, must be a power of two
    pub fn new(size: usize, alignment: usize) -> Result<Self, SortError> {
        if size == 0 {
            return Err(SortError::InvalidConfig("block size must be positive".into()));
        }
        let layout = Layout::from_size_align(size, alignment).map_err(|_| SortError::Alignment {
            address: 0,
            len: size,
            alignment,
        })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        return Ok(AlignedBlock { ptr, layout });
    }

    /// Alignment the block was allocated with.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Checks the block is suitable for a device with the given block size and alignment.
    pub fn check_alignment(&self, block_size: usize, alignment: usize) -> Result<(), SortError> {
        let address = self.ptr.as_ptr() as usize;
        if address % alignment != 0 || self.len() != block_size {
            return Err(SortError::Alignment {
                address,
                len: self.len(),
                alignment,
            });
        }

        return Ok(());
    }
}

impl Deref for AlignedBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBlock")
            .field("address", &self.ptr)
            .field("len", &self.layout.size())
            .field("alignment", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::AlignedBlock;
    use crate::sort::SortError;

    #[rstest]
    #[case(64, 64)]
    #[case(4096, 4096)]
    #[case(8192, 512)]
    fn test_aligned_allocation(#[case] size: usize, #[case] alignment: usize) {
        let mut block = AlignedBlock::new(size, alignment).unwrap();

        assert_eq!(block.as_ptr() as usize % alignment, 0);
        assert_eq!(block.len(), size);
        assert!(block.iter().all(|byte| *byte == 0));

        block[size - 1] = 7;
        assert_eq!(block[size - 1], 7);
        block.check_alignment(size, alignment).unwrap();
    }

    #[test]
    fn test_alignment_mismatch() {
        let block = AlignedBlock::new(128, 64).unwrap();

        assert!(matches!(
            block.check_alignment(64, 64),
            Err(SortError::Alignment { len: 128, alignment: 64, .. })
        ));
        assert!(matches!(AlignedBlock::new(64, 3), Err(SortError::Alignment { .. })));
    }
}
