//! shmforge - shared-memory collectives for multi-process CPU inference
//!
//! Ranks of a tensor-parallel CPU worker group exchange tensors through one
//! memory-mapped segment per group: all-reduce (sum), gather, all-gather,
//! barrier, and ordered point-to-point tensor lists.
//!
//! The handle-based operations in [`ops`] are the entry points for a host
//! runtime; [`ShmManager`] is the typed API underneath.

#![allow(clippy::needless_range_loop)] // Rank loops index several per-rank tables
#![allow(clippy::manual_slice_size_calculation)] // Byte counts spelled out next to element counts

pub mod ccl;
pub mod error;
pub mod logging;
pub mod ops;
pub mod registry;
pub mod shm;
pub mod tensor;

pub use ccl::{CollectiveKind, ReduceElement, ShmManager, StatsSnapshot};
pub use error::{ErrorCategory, ForgeResult, ShmForgeError};
pub use ops::{
    init_shm_manager, init_shm_manager_with_config, join_shm_manager, release_shm_manager,
    shm_all_gather, shm_allreduce, shm_barrier, shm_gather, shm_recv_tensor_list,
    shm_send_tensor_list, shm_stats,
};
pub use shm::ShmConfig;
pub use tensor::{DType, HostTensor};
