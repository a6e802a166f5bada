//! Fixed-size records.

use std::cmp::Ordering;

/// Fixed-size, totally ordered value stored back-to-back in native byte order.
pub trait Record: Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decodes a record from the first [`Record::SIZE`] bytes of `bytes`.
    fn read_from(bytes: &[u8]) -> Self;

    /// Encodes the record into the first [`Record::SIZE`] bytes of `bytes`.
    fn write_to(&self, bytes: &mut [u8]);

    /// Total order used for sorting, merging and order checking.
    fn compare(&self, other: &Self) -> Ordering;

    /// Whether records can be drawn uniformly from `[low, high)`.
    fn is_sample_range(low: &Self, high: &Self) -> bool {
        low.compare(high).is_lt()
    }
}

macro_rules! int_record {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_to(&self, bytes: &mut [u8]) {
                    bytes[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                fn compare(&self, other: &Self) -> Ordering {
                    self.cmp(other)
                }
            }
        )*
    };
}

macro_rules! float_record {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_to(&self, bytes: &mut [u8]) {
                    bytes[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                // IEEE 754 total order, NaNs included
                fn compare(&self, other: &Self) -> Ordering {
                    self.total_cmp(other)
                }

                // bounds and span must be finite
                fn is_sample_range(low: &Self, high: &Self) -> bool {
                    low.is_finite() && high.is_finite() && low < high && (high - low).is_finite()
                }
            }
        )*
    };
}

int_record!(u32, u64, i32, i64);
float_record!(f32, f64);

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::*;

    use super::Record;

    #[rstest]
    #[case(0.5, 1.5, Ordering::Less)]
    #[case(2.0, 2.0, Ordering::Equal)]
    #[case(-0.0, 0.0, Ordering::Less)]
    #[case(f64::INFINITY, f64::MAX, Ordering::Greater)]
    fn test_f64_order(#[case] a: f64, #[case] b: f64, #[case] expected: Ordering) {
        assert_eq!(a.compare(&b), expected);
    }

    #[rstest]
    #[case(0.0, 10000.0, true)]
    #[case(-1.0, -1.0, false)]
    #[case(0.0, f64::INFINITY, false)]
    #[case(f64::NAN, 1.0, false)]
    #[case(f64::MIN, f64::MAX, false)]
    fn test_f64_sample_range(#[case] low: f64, #[case] high: f64, #[case] expected: bool) {
        assert_eq!(f64::is_sample_range(&low, &high), expected);
    }

    #[test]
    fn test_int_sample_range() {
        assert!(u32::is_sample_range(&0, &u32::MAX));
        assert!(!i64::is_sample_range(&5, &-5));
    }

    #[test]
    fn test_native_byte_order() {
        let mut bytes = [0u8; 12];
        1234.5f64.write_to(&mut bytes[4..]);

        assert_eq!(&bytes[4..], &1234.5f64.to_ne_bytes());
        assert_eq!(f64::read_from(&bytes[4..]), 1234.5);
        assert_eq!(<f64 as Record>::SIZE, 8);
        assert_eq!(<u32 as Record>::SIZE, 4);
    }
}
