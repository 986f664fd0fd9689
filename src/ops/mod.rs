//! Handle-based collective operations
//!
//! This is the operator surface exposed to the host runtime: managers are
//! addressed by the `i64` handle returned from [`init_shm_manager`], ranks
//! arrive as `i64`, and buffers are [`HostTensor`]s. Each call validates its
//! arguments, looks the manager up in the process-wide registry and forwards
//! to the typed [`ShmManager`](crate::ccl::ShmManager) methods.

use crate::ccl::StatsSnapshot;
use crate::error::{ForgeResult, ShmForgeError};
use crate::registry;
use crate::shm::{validate_name, ShmConfig, MAX_GROUP_SIZE};
use crate::tensor::{DType, HostTensor};
use half::{bf16, f16};

/// Create (rank 0) or attach to (other ranks) the segment `name`, with
/// configuration taken from `SHMFORGE_*` environment variables
///
/// Returns the handle used by every other operation.
pub fn init_shm_manager(name: &str, group_size: i64, rank: i64) -> ForgeResult<i64> {
    init_shm_manager_with_config(name, group_size, rank, ShmConfig::from_env()?)
}

/// [`init_shm_manager`] with an explicit configuration
pub fn init_shm_manager_with_config(
    name: &str,
    group_size: i64,
    rank: i64,
    config: ShmConfig,
) -> ForgeResult<i64> {
    if group_size < 1 || group_size > MAX_GROUP_SIZE as i64 {
        return Err(ShmForgeError::InvalidGroupSize(group_size));
    }
    let group = group_size as usize;
    let rank = to_rank(rank, group)?;
    validate_name(name)?;

    registry::register_with(name, rank, || {
        crate::ccl::ShmManager::new(name, group, rank, config)
    })
}

/// Block until every rank of the group attached; returns `name`
pub fn join_shm_manager(handle: i64, name: &str) -> ForgeResult<String> {
    registry::get(handle)?.join(name)
}

/// In-place sum of `data` across all ranks
///
/// # Errors
/// `UnsupportedDtype` for 8-bit integer tensors.
pub fn shm_allreduce(handle: i64, data: &mut HostTensor) -> ForgeResult<()> {
    let manager = registry::get(handle)?;
    match data.dtype() {
        DType::F32 => manager.allreduce(data.as_mut_slice::<f32>()?),
        DType::F16 => manager.allreduce(data.as_mut_slice::<f16>()?),
        DType::BF16 => manager.allreduce(data.as_mut_slice::<bf16>()?),
        DType::F64 => manager.allreduce(data.as_mut_slice::<f64>()?),
        DType::I32 => manager.allreduce(data.as_mut_slice::<i32>()?),
        DType::I64 => manager.allreduce(data.as_mut_slice::<i64>()?),
        other => Err(ShmForgeError::UnsupportedDtype(format!(
            "allreduce does not support {}",
            other
        ))),
    }
}

/// Gather every rank's `data` into `outputs` on rank `dst`
///
/// `outputs` is only read on `dst`, where it must hold `group_size` tensors
/// with `data`'s dtype and element count. On other ranks it is left untouched.
pub fn shm_gather(
    handle: i64,
    data: &HostTensor,
    outputs: Option<&mut [HostTensor]>,
    dst: i64,
) -> ForgeResult<()> {
    let manager = registry::get(handle)?;
    let dst = to_rank(dst, manager.group_size())?;

    if manager.rank() != dst {
        return manager.gather_bytes(data.as_bytes(), None, dst);
    }

    let outputs = outputs.ok_or_else(|| {
        ShmForgeError::InvalidArgument(format!("rank {} is the gather destination but has no outputs", dst))
    })?;
    for out in outputs.iter() {
        check_like(data, out)?;
    }
    let mut views: Vec<&mut [u8]> = outputs.iter_mut().map(|t| t.as_bytes_mut()).collect();
    manager.gather_bytes(data.as_bytes(), Some(views.as_mut_slice()), dst)
}

/// Concatenate every rank's `data` into `output`, in rank order
///
/// `output` must have `data`'s dtype and `group_size` times its elements.
pub fn shm_all_gather(handle: i64, data: &HostTensor, output: &mut HostTensor) -> ForgeResult<()> {
    let manager = registry::get(handle)?;
    check_dtype(data.dtype(), output.dtype())?;
    let expected = data.numel() * manager.group_size();
    if output.numel() != expected {
        return Err(ShmForgeError::SizeMismatch {
            expected,
            actual: output.numel(),
        });
    }
    manager.all_gather_bytes(data.as_bytes(), output.as_bytes_mut())
}

/// Send an ordered list of tensors to rank `dst`
pub fn shm_send_tensor_list(handle: i64, tensor_list: &[HostTensor], dst: i64) -> ForgeResult<()> {
    let manager = registry::get(handle)?;
    let dst = to_rank(dst, manager.group_size())?;
    manager.send_tensor_list(tensor_list, dst)
}

/// Receive the next tensor list sent by rank `src`
pub fn shm_recv_tensor_list(handle: i64, src: i64) -> ForgeResult<Vec<HostTensor>> {
    let manager = registry::get(handle)?;
    let src = to_rank(src, manager.group_size())?;
    manager.recv_tensor_list(src)
}

/// Block until every rank of the group reached the barrier
pub fn shm_barrier(handle: i64) -> ForgeResult<()> {
    registry::get(handle)?.barrier()
}

/// Counters of the manager behind `handle`
pub fn shm_stats(handle: i64) -> ForgeResult<StatsSnapshot> {
    Ok(registry::get(handle)?.stats())
}

/// Release a manager; rank 0 removes the segment once detached
pub fn release_shm_manager(handle: i64) -> ForgeResult<()> {
    registry::release(handle)
}

fn to_rank(value: i64, group_size: usize) -> ForgeResult<usize> {
    if value < 0 || value >= group_size as i64 {
        return Err(ShmForgeError::InvalidRank {
            rank: value,
            group_size: group_size as i64,
        });
    }
    Ok(value as usize)
}

fn check_dtype(expected: DType, actual: DType) -> ForgeResult<()> {
    if expected != actual {
        return Err(ShmForgeError::DtypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn check_like(data: &HostTensor, out: &HostTensor) -> ForgeResult<()> {
    check_dtype(data.dtype(), out.dtype())?;
    if out.numel() != data.numel() {
        return Err(ShmForgeError::SizeMismatch {
            expected: data.numel(),
            actual: out.numel(),
        });
    }
    Ok(())
}
