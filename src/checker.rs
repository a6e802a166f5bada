//! Order checking.

use log;

use crate::record::Record;
use crate::sequence::DiskSequence;
use crate::sort::SortError;

/// Returns the index of the first record that is less than its predecessor, or [`None`] if the sequence
/// is sorted in ascending order. Stops at the first violation.
pub fn first_violation<R: Record>(sequence: &mut DiskSequence<R>) -> Result<Option<u64>, SortError> {
    let mut previous: Option<R> = None;

    for (index, record) in sequence.iter()?.enumerate() {
        let record = record?;
        if let Some(previous) = previous {
            if previous.compare(&record).is_gt() {
                log::debug!("order violation found at record {}", index);
                return Ok(Some(index as u64));
            }
        }
        previous = Some(record);
    }

    return Ok(None);
}

/// Checks whether the sequence is sorted in ascending order.
pub fn is_sorted<R: Record>(sequence: &mut DiskSequence<R>) -> Result<bool, SortError> {
    Ok(first_violation(sequence)?.is_none())
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{first_violation, is_sorted};
    use crate::sequence::DiskSequence;
    use crate::store::test::store_with_records;

    #[rstest]
    #[case(vec![], None)]
    #[case(vec![5.0], None)]
    #[case(vec![1.0, 1.0, 2.0, 3.5], None)]
    #[case(vec![2.0, 1.0], Some(1))]
    #[case(vec![-1.0, 0.0, 3.0, 7.0, 7.0, 6.0, 8.0], Some(5))]
    #[case(Vec::from_iter((0..100).map(|value| value as f64)), None)]
    #[case(Vec::from_iter((0..100).map(|value| if value == 57 { 0.0 } else { value as f64 })), Some(57))]
    fn test_first_violation(#[case] values: Vec<f64>, #[case] expected: Option<u64>) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = store_with_records(&tmp_dir.path().join("data.bin"), &values, 64);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap();

        assert_eq!(first_violation(&mut sequence).unwrap(), expected);
        assert_eq!(is_sorted(&mut sequence).unwrap(), expected.is_none());
    }

    #[rstest]
    #[case(1, true)]
    #[case(2, false)]
    #[case(5, false)]
    fn test_interleaved_chunks(#[case] chunks: usize, #[case] expected: bool) {
        // chunk k holds k, k + chunks, k + 2 * chunks, ...
        let values = Vec::from_iter((0..chunks).flat_map(|chunk| (0..30).map(move |i| (chunk + i * chunks) as f64)));

        let tmp_dir = tempfile::tempdir().unwrap();
        let store = store_with_records(&tmp_dir.path().join("data.bin"), &values, 64);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap();

        assert_eq!(is_sorted(&mut sequence).unwrap(), expected);
    }

    #[test]
    fn test_globally_ordered_chunks() {
        let values = Vec::from_iter((0..3).flat_map(|chunk| (0..30).map(move |i| (chunk * 30 + i) as f64)));

        let tmp_dir = tempfile::tempdir().unwrap();
        let store = store_with_records(&tmp_dir.path().join("data.bin"), &values, 64);
        let mut sequence: DiskSequence<f64> = DiskSequence::open(&store, 8).unwrap();

        assert!(is_sorted(&mut sequence).unwrap());
    }
}
