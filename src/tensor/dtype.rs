//! Element types carried by host tensors

use crate::error::{ForgeResult, ShmForgeError};
use half::{bf16, f16};
use std::fmt;

/// Element type of a [`HostTensor`](super::HostTensor)
///
/// The `u8` discriminant is the wire code used by tensor-list messages and
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F16 = 1,
    BF16 = 2,
    F64 = 3,
    I8 = 4,
    U8 = 5,
    I32 = 6,
    I64 = 7,
}

impl DType {
    /// All supported element types
    pub const ALL: [DType; 8] = [
        DType::F32,
        DType::F16,
        DType::BF16,
        DType::F64,
        DType::I8,
        DType::U8,
        DType::I32,
        DType::I64,
    ];

    /// Size of one element in bytes
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Canonical name, matching the host runtime's dtype strings
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F64 => "float64",
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::I32 => "int32",
            DType::I64 => "int64",
        }
    }

    /// Parse a dtype name; accepts the canonical names and common short forms
    pub fn parse(s: &str) -> ForgeResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "float32" | "float" | "f32" | "fp32" => Ok(DType::F32),
            "float16" | "half" | "f16" | "fp16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            "float64" | "double" | "f64" | "fp64" => Ok(DType::F64),
            "int8" | "i8" => Ok(DType::I8),
            "uint8" | "u8" => Ok(DType::U8),
            "int32" | "int" | "i32" => Ok(DType::I32),
            "int64" | "long" | "i64" => Ok(DType::I64),
            other => Err(ShmForgeError::UnsupportedDtype(other.to_string())),
        }
    }

    /// Wire code of this dtype
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        DType::ALL.iter().copied().find(|d| d.code() == code)
    }

    /// Whether `allreduce` can sum this dtype
    pub fn is_reducible(self) -> bool {
        !matches!(self, DType::I8 | DType::U8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust scalar types that map to a [`DType`]
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($t:ty => $d:expr),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = $d;
            }
        )*
    };
}

impl_element! {
    f32 => DType::F32,
    f16 => DType::F16,
    bf16 => DType::BF16,
    f64 => DType::F64,
    i8 => DType::I8,
    u8 => DType::U8,
    i32 => DType::I32,
    i64 => DType::I64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
        for dtype in DType::ALL {
            assert!(dtype.size_in_bytes().is_power_of_two());
        }
    }

    #[test]
    fn test_dtype_codes_are_stable() {
        assert_eq!(DType::F32.code(), 0);
        assert_eq!(DType::I64.code(), 7);
        for dtype in DType::ALL {
            assert_eq!(DType::from_code(dtype.code()), Some(dtype));
        }
        assert_eq!(DType::from_code(200), None);
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!(DType::parse("float32").unwrap(), DType::F32);
        assert_eq!(DType::parse("BF16").unwrap(), DType::BF16);
        assert_eq!(DType::parse("half").unwrap(), DType::F16);
        assert!(matches!(
            DType::parse("complex64"),
            Err(ShmForgeError::UnsupportedDtype(_))
        ));
        for dtype in DType::ALL {
            assert_eq!(DType::parse(dtype.as_str()).unwrap(), dtype);
        }
    }

    #[test]
    fn test_element_dtypes() {
        assert_eq!(<f32 as Element>::DTYPE, DType::F32);
        assert_eq!(<bf16 as Element>::DTYPE, DType::BF16);
        assert_eq!(<i32 as Element>::DTYPE, DType::I32);
        assert!(DType::F16.is_reducible());
        assert!(!DType::U8.is_reducible());
    }
}
