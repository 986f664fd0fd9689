//! Collective communication over shared-memory segments
//!
//! - [`ShmManager`] - one rank's handle on a group: allreduce, gather,
//!   all-gather, barrier and point-to-point tensor lists
//! - [`codec`] - wire format of point-to-point tensor lists
//! - [`reduce`] - deterministic cross-rank summation

pub mod codec;
pub mod manager;
pub mod p2p;
pub mod reduce;
pub mod stats;

pub use manager::ShmManager;
pub use reduce::ReduceElement;
pub use stats::{CollectiveKind, CollectiveStats, StatsSnapshot};
