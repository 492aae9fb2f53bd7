//! Traits for the numeric types used as dataset elements and distance values.

use core::fmt::{Debug, Display};

/// A trait for types that can be used as dataset elements or distance values.
///
/// We provide a blanket implementation for all types that satisfy the trait
/// bounds. This includes all primitive numeric types.
#[must_use]
pub trait Number:
    PartialEq
    + PartialOrd
    + Copy
    + Display
    + Debug
    + Default
    + Send
    + Sync
    + 'static
    + num_traits::Num
    + num_traits::NumCast
    + num_traits::NumAssignOps
    + num_traits::Bounded
    + num_traits::ToPrimitive
    + num_traits::FromPrimitive
    + core::iter::Sum
{
    /// Returns the absolute difference between two values.
    ///
    /// This is well-defined for unsigned types, where plain subtraction would
    /// wrap.
    fn abs_diff(self, other: Self) -> Self {
        if self < other {
            other - self
        } else {
            self - other
        }
    }

    /// Converts the value to an `f64`, saturating when the conversion is not
    /// representable.
    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::MAX)
    }

    /// Converts from any primitive numeric value, saturating to the maximum
    /// value of `Self` when the conversion is not representable.
    fn cast<N: num_traits::ToPrimitive>(n: N) -> Self {
        num_traits::NumCast::from(n).unwrap_or_else(Self::max_value)
    }
}

/// Blanket implementation of `Number` for all types that satisfy the trait bounds.
impl<T> Number for T where
    T: PartialEq
        + PartialOrd
        + Copy
        + Display
        + Debug
        + Default
        + Send
        + Sync
        + 'static
        + num_traits::Num
        + num_traits::NumCast
        + num_traits::NumAssignOps
        + num_traits::Bounded
        + num_traits::ToPrimitive
        + num_traits::FromPrimitive
        + core::iter::Sum
{
}

/// A trait for types that can be used as floating-point distance values.
pub trait Float: Number + num_traits::Float {}

impl<T> Float for T where T: Number + num_traits::Float {}

/// The scalar types a dataset may be built from.
///
/// Unlike [`Number`], this trait is implemented exactly for the supported
/// element types so that each carries a stable on-disk type tag. Packed
/// bitstrings are `u8` rows interpreted by the Hamming metric.
pub trait Element: Number {
    /// The on-disk tag for this element type.
    const DATA_TYPE: DataType;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}

/// Tags for the supported dataset element types, as stored in index
/// snapshot headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// 8-bit unsigned integers, also used for packed bitstrings.
    U8,
    /// 32-bit signed integers.
    I32,
    /// 32-bit floats.
    F32,
    /// 64-bit floats.
    F64,
}

impl DataType {
    /// The numeric code written to snapshot headers.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I32 => 1,
            Self::F32 => 2,
            Self::F64 => 3,
        }
    }

    /// Recovers a `DataType` from its header code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::U8),
            1 => Some(Self::I32),
            2 => Some(Self::F32),
            3 => Some(Self::F64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_diff_is_symmetric_for_unsigned() {
        assert_eq!(Number::abs_diff(3_u8, 7), 4);
        assert_eq!(Number::abs_diff(7_u8, 3), 4);
        assert_eq!(Number::abs_diff(0_u8, 255), 255);
    }

    #[test]
    fn cast_saturates() {
        let v: u8 = Number::cast(1_000_i64);
        assert_eq!(v, u8::MAX);
        let v: u32 = Number::cast(-1.5_f64);
        assert_eq!(v, u32::MAX);
        let v: f32 = Number::cast(2.5_f64);
        assert!((v - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn data_type_codes_round_trip() {
        for dt in [DataType::U8, DataType::I32, DataType::F32, DataType::F64] {
            assert_eq!(DataType::from_code(dt.code()), Some(dt));
        }
        assert_eq!(DataType::from_code(17), None);
    }
}
