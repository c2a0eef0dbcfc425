//! Cell datatypes and typed value access.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Physical datatype of a dimension or attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// ASCII characters; always variable-sized.
    StringAscii,
}

impl Datatype {
    /// Size of one value in bytes.
    pub fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 | Datatype::StringAscii => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// Whether values are character strings.
    pub fn is_string(self) -> bool {
        matches!(self, Datatype::StringAscii)
    }

    /// Whether values are floating point.
    pub fn is_float(self) -> bool {
        matches!(self, Datatype::Float32 | Datatype::Float64)
    }

    /// Whether values are signed integers.
    pub fn is_signed_int(self) -> bool {
        matches!(
            self,
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 | Datatype::Int64
        )
    }

    /// Compare two little-endian encoded values.
    ///
    /// Strings compare bytewise; floats use a total order so NaN never
    /// breaks sorting.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Datatype::Int8 => i8::from_le_slice(a).cmp(&i8::from_le_slice(b)),
            Datatype::Int16 => i16::from_le_slice(a).cmp(&i16::from_le_slice(b)),
            Datatype::Int32 => i32::from_le_slice(a).cmp(&i32::from_le_slice(b)),
            Datatype::Int64 => i64::from_le_slice(a).cmp(&i64::from_le_slice(b)),
            Datatype::UInt8 => u8::from_le_slice(a).cmp(&u8::from_le_slice(b)),
            Datatype::UInt16 => u16::from_le_slice(a).cmp(&u16::from_le_slice(b)),
            Datatype::UInt32 => u32::from_le_slice(a).cmp(&u32::from_le_slice(b)),
            Datatype::UInt64 => u64::from_le_slice(a).cmp(&u64::from_le_slice(b)),
            Datatype::Float32 => f32::from_le_slice(a).total_cmp(&f32::from_le_slice(b)),
            Datatype::Float64 => f64::from_le_slice(a).total_cmp(&f64::from_le_slice(b)),
            Datatype::StringAscii => a.cmp(b),
        }
    }

    /// Decode a numeric value as `f64`. Strings decode to 0.
    pub fn to_f64(self, bytes: &[u8]) -> f64 {
        match self {
            Datatype::Int8 => i8::from_le_slice(bytes) as f64,
            Datatype::Int16 => i16::from_le_slice(bytes) as f64,
            Datatype::Int32 => i32::from_le_slice(bytes) as f64,
            Datatype::Int64 => i64::from_le_slice(bytes) as f64,
            Datatype::UInt8 => u8::from_le_slice(bytes) as f64,
            Datatype::UInt16 => u16::from_le_slice(bytes) as f64,
            Datatype::UInt32 => u32::from_le_slice(bytes) as f64,
            Datatype::UInt64 => u64::from_le_slice(bytes) as f64,
            Datatype::Float32 => f32::from_le_slice(bytes) as f64,
            Datatype::Float64 => f64::from_le_slice(bytes),
            Datatype::StringAscii => 0.0,
        }
    }

    /// Decode an integer value exactly. `None` for floats and strings.
    pub fn to_i128(self, bytes: &[u8]) -> Option<i128> {
        let v = match self {
            Datatype::Int8 => i8::from_le_slice(bytes) as i128,
            Datatype::Int16 => i16::from_le_slice(bytes) as i128,
            Datatype::Int32 => i32::from_le_slice(bytes) as i128,
            Datatype::Int64 => i64::from_le_slice(bytes) as i128,
            Datatype::UInt8 => u8::from_le_slice(bytes) as i128,
            Datatype::UInt16 => u16::from_le_slice(bytes) as i128,
            Datatype::UInt32 => u32::from_le_slice(bytes) as i128,
            Datatype::UInt64 => u64::from_le_slice(bytes) as i128,
            _ => return None,
        };
        Some(v)
    }
}

/// A fixed-size value that can be stored in a tile.
pub trait FixedValue: Copy + Send + Sync + 'static {
    /// Datatype the value maps to.
    const DATATYPE: Datatype;

    /// Encode as little-endian bytes.
    fn to_le_vec(self) -> Vec<u8>;

    /// Decode from the first `size_of::<Self>()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! fixed_value {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl FixedValue for $ty {
                const DATATYPE: Datatype = Datatype::$dt;

                fn to_le_vec(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

fixed_value! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// Decode a packed little-endian column.
pub fn decode_values<T: FixedValue>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(T::from_le_slice)
        .collect()
}

/// Encode a column as packed little-endian bytes.
pub fn encode_values<T: FixedValue>(values: &[T]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_signed() {
        let a = (-5i32).to_le_vec();
        let b = 3i32.to_le_vec();
        assert_eq!(Datatype::Int32.compare(&a, &b), Ordering::Less);
        assert_eq!(Datatype::Int32.compare(&b, &a), Ordering::Greater);
        assert_eq!(Datatype::Int32.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_compare_strings_bytewise() {
        assert_eq!(Datatype::StringAscii.compare(b"ab", b"b"), Ordering::Less);
        assert_eq!(Datatype::StringAscii.compare(b"ab", b"a"), Ordering::Greater);
    }

    #[test]
    fn test_float_total_order() {
        let nan = f64::NAN.to_le_vec();
        let one = 1.0f64.to_le_vec();
        assert_ne!(Datatype::Float64.compare(&nan, &one), Ordering::Equal);
    }

    #[test]
    fn test_encode_decode_column() {
        let bytes = encode_values(&[1u16, 2, 300]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode_values::<u16>(&bytes), vec![1, 2, 300]);
        assert_eq!(Datatype::UInt16.to_i128(&bytes[4..]), Some(300));
        assert_eq!(Datatype::Float32.to_i128(&[0; 4]), None);
    }
}
