//! Shared-memory segments: layout, creation/attachment and cross-process waiting

pub mod config;
pub mod futex;
pub mod layout;
pub mod segment;

pub use config::ShmConfig;
pub use layout::{SegmentLayout, MAX_GROUP_SIZE};
pub use segment::{inspect, segment_path, validate_name, SegmentInfo, ShmSegment};
