//! Wire format for point-to-point tensor lists
//!
//! All integers are little-endian:
//!
//! ```text
//! count: u32
//! repeated count times:
//!     dtype: u8          DType wire code
//!     ndim:  u32
//!     dims:  u64 * ndim
//!     nbytes: u64
//!     data:  nbytes bytes
//! ```

use crate::error::{ForgeResult, ShmForgeError};
use crate::tensor::{DType, HostTensor};

/// Dimensions beyond this are treated as corruption
pub const MAX_NDIM: usize = 32;

/// Exact encoded size of `tensors`
pub fn encoded_len(tensors: &[HostTensor]) -> usize {
    4 + tensors
        .iter()
        .map(|t| 1 + 4 + 8 * t.shape().len() + 8 + t.nbytes())
        .sum::<usize>()
}

/// Serialize a tensor list
pub fn encode_tensor_list(tensors: &[HostTensor]) -> ForgeResult<Vec<u8>> {
    let count = u32::try_from(tensors.len()).map_err(|_| {
        ShmForgeError::InvalidArgument(format!("too many tensors: {}", tensors.len()))
    })?;

    let mut buf = Vec::with_capacity(encoded_len(tensors));
    buf.extend_from_slice(&count.to_le_bytes());
    for tensor in tensors {
        if tensor.shape().len() > MAX_NDIM {
            return Err(ShmForgeError::InvalidTensorShape(format!(
                "{} dimensions, limit is {}",
                tensor.shape().len(),
                MAX_NDIM
            )));
        }
        buf.push(tensor.dtype().code());
        buf.extend_from_slice(&(tensor.shape().len() as u32).to_le_bytes());
        for &dim in tensor.shape() {
            buf.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        buf.extend_from_slice(&(tensor.nbytes() as u64).to_le_bytes());
        buf.extend_from_slice(tensor.as_bytes());
    }
    Ok(buf)
}

/// Deserialize a tensor list produced by [`encode_tensor_list`]
pub fn decode_tensor_list(bytes: &[u8]) -> ForgeResult<Vec<HostTensor>> {
    let mut reader = Reader { bytes, pos: 0 };
    let count = reader.u32()? as usize;

    // Each tensor needs at least 13 header bytes
    if count > reader.remaining() / 13 {
        return Err(malformed(format!(
            "count {} does not fit in {} bytes",
            count,
            bytes.len()
        )));
    }

    let mut tensors = Vec::with_capacity(count);
    for index in 0..count {
        let code = reader.u8()?;
        let dtype = DType::from_code(code)
            .ok_or_else(|| malformed(format!("tensor {}: unknown dtype code {}", index, code)))?;

        let ndim = reader.u32()? as usize;
        if ndim > MAX_NDIM {
            return Err(malformed(format!("tensor {}: {} dimensions", index, ndim)));
        }
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let dim = usize::try_from(reader.u64()?)
                .map_err(|_| malformed(format!("tensor {}: dimension overflows", index)))?;
            shape.push(dim);
        }

        let nbytes = usize::try_from(reader.u64()?)
            .map_err(|_| malformed(format!("tensor {}: byte length overflows", index)))?;
        let expected = shape
            .iter()
            .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| malformed(format!("tensor {}: shape {:?} overflows", index, shape)))?;
        if nbytes != expected {
            return Err(malformed(format!(
                "tensor {}: {} bytes for {} {:?} (expected {})",
                index, nbytes, dtype, shape, expected
            )));
        }

        let data = reader.take(nbytes)?;
        tensors.push(HostTensor::from_bytes(dtype, &shape, data)?);
    }

    if reader.remaining() != 0 {
        return Err(malformed(format!(
            "{} trailing bytes after {} tensors",
            reader.remaining(),
            count
        )));
    }
    Ok(tensors)
}

fn malformed(msg: String) -> ShmForgeError {
    ShmForgeError::MalformedMessage(msg)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> ForgeResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(malformed(format!(
                "truncated: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> ForgeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> ForgeResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> ForgeResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}
