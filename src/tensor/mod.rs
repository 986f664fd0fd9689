//! Host tensors exchanged through the collectives
//!
//! The collective layer is agnostic to element type beyond byte length, except
//! for `allreduce`, which must know how to add elements.

pub mod dtype;
pub mod host;

pub use dtype::{DType, Element};
pub use host::{HostTensor, TensorData, TensorElement};
