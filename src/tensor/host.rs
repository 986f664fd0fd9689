//! Contiguous CPU tensor used at the collective boundary
//!
//! This is the minimal stand-in for the host runtime's tensor: a dtype, a
//! shape and contiguous row-major storage. Storage is kept typed so that
//! slices are always correctly aligned for their element type.

use super::dtype::{DType, Element};
use crate::error::{ForgeResult, ShmForgeError};
use half::{bf16, f16};

/// Typed backing storage of a [`HostTensor`]
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// Dispatch on the typed storage, binding the inner `Vec` to `$v`.
macro_rules! with_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::F32($v) => $body,
            TensorData::F16($v) => $body,
            TensorData::BF16($v) => $body,
            TensorData::F64($v) => $body,
            TensorData::I8($v) => $body,
            TensorData::U8($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::I64($v) => $body,
        }
    };
}

impl TensorData {
    fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; numel]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; numel]),
            DType::BF16 => TensorData::BF16(vec![bf16::ZERO; numel]),
            DType::F64 => TensorData::F64(vec![0.0; numel]),
            DType::I8 => TensorData::I8(vec![0; numel]),
            DType::U8 => TensorData::U8(vec![0; numel]),
            DType::I32 => TensorData::I32(vec![0; numel]),
            DType::I64 => TensorData::I64(vec![0; numel]),
        }
    }

    /// Copy raw bytes into typed storage. `bytes.len()` must be a multiple
    /// of the element size; no alignment is required.
    fn from_bytes(dtype: DType, bytes: &[u8]) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DType::F16 => TensorData::F16(bytemuck::pod_collect_to_vec(bytes)),
            DType::BF16 => TensorData::BF16(bytemuck::pod_collect_to_vec(bytes)),
            DType::F64 => TensorData::F64(bytemuck::pod_collect_to_vec(bytes)),
            DType::I8 => TensorData::I8(bytemuck::pod_collect_to_vec(bytes)),
            DType::U8 => TensorData::U8(bytes.to_vec()),
            DType::I32 => TensorData::I32(bytemuck::pod_collect_to_vec(bytes)),
            DType::I64 => TensorData::I64(bytemuck::pod_collect_to_vec(bytes)),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F16(_) => DType::F16,
            TensorData::BF16(_) => DType::BF16,
            TensorData::F64(_) => DType::F64,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        with_data!(self, v => v.len())
    }

    fn as_bytes(&self) -> &[u8] {
        with_data!(self, v => bytemuck::cast_slice(v.as_slice()))
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        with_data!(self, v => bytemuck::cast_slice_mut(v.as_mut_slice()))
    }
}

/// Scalar types that can be viewed out of [`TensorData`]
pub trait TensorElement: Element {
    fn wrap(values: Vec<Self>) -> TensorData;
    fn view(data: &TensorData) -> Option<&[Self]>;
    fn view_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

macro_rules! impl_tensor_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl TensorElement for $t {
                fn wrap(values: Vec<Self>) -> TensorData {
                    TensorData::$variant(values)
                }

                fn view(data: &TensorData) -> Option<&[Self]> {
                    match data {
                        TensorData::$variant(v) => Some(v.as_slice()),
                        _ => None,
                    }
                }

                fn view_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                    match data {
                        TensorData::$variant(v) => Some(v.as_mut_slice()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_tensor_element! {
    f32 => F32,
    f16 => F16,
    bf16 => BF16,
    f64 => F64,
    i8 => I8,
    u8 => U8,
    i32 => I32,
    i64 => I64,
}

/// Contiguous, row-major CPU tensor
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl HostTensor {
    /// Zero-filled tensor
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: TensorData::zeros(dtype, numel),
        }
    }

    /// Build a tensor from owned values
    ///
    /// # Errors
    /// Returns `InvalidTensorShape` if the shape does not describe `values.len()` elements.
    pub fn from_vec<T: TensorElement>(shape: &[usize], values: Vec<T>) -> ForgeResult<Self> {
        check_numel(shape, values.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: T::wrap(values),
        })
    }

    /// Build a tensor by copying a slice
    pub fn from_slice<T: TensorElement>(shape: &[usize], values: &[T]) -> ForgeResult<Self> {
        Self::from_vec(shape, values.to_vec())
    }

    /// Build a 1-D tensor from a slice
    pub fn from_1d<T: TensorElement>(values: &[T]) -> Self {
        Self {
            shape: vec![values.len()],
            data: T::wrap(values.to_vec()),
        }
    }

    /// Build a tensor from raw little-endian bytes
    ///
    /// # Errors
    /// Returns `SizeMismatch` if `bytes` does not hold exactly
    /// `numel * dtype.size_in_bytes()` bytes.
    pub fn from_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> ForgeResult<Self> {
        let numel: usize = shape.iter().product();
        let expected = numel * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(ShmForgeError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::from_bytes(dtype, bytes),
        })
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the storage in bytes
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_bytes_mut()
    }

    /// Typed view of the storage
    ///
    /// # Errors
    /// Returns `DtypeMismatch` if `T` is not this tensor's element type.
    pub fn as_slice<T: TensorElement>(&self) -> ForgeResult<&[T]> {
        let dtype = self.dtype();
        T::view(&self.data).ok_or_else(|| dtype_mismatch(T::DTYPE, dtype))
    }

    /// Mutable typed view of the storage
    pub fn as_mut_slice<T: TensorElement>(&mut self) -> ForgeResult<&mut [T]> {
        let dtype = self.dtype();
        T::view_mut(&mut self.data).ok_or_else(|| dtype_mismatch(T::DTYPE, dtype))
    }

    /// Copy the elements out
    pub fn to_vec<T: TensorElement>(&self) -> ForgeResult<Vec<T>> {
        self.as_slice::<T>().map(|s| s.to_vec())
    }

    /// Reinterpret with a new shape of the same element count
    pub fn reshape(mut self, shape: &[usize]) -> ForgeResult<Self> {
        check_numel(shape, self.numel())?;
        self.shape = shape.to_vec();
        Ok(self)
    }
}

fn check_numel(shape: &[usize], numel: usize) -> ForgeResult<()> {
    let expected: usize = shape.iter().product();
    if expected != numel {
        return Err(ShmForgeError::InvalidTensorShape(format!(
            "shape {:?} describes {} elements but {} were given",
            shape, expected, numel
        )));
    }
    Ok(())
}

fn dtype_mismatch(expected: DType, actual: DType) -> ShmForgeError {
    ShmForgeError::DtypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
