//! Unified error handling for shmforge
//!
//! Every fallible operation in the crate returns [`ForgeResult`]. Errors are
//! grouped into categories so callers can decide what to do with them:
//! - User errors (bad rank, bad handle, mismatched buffers)
//! - Resource errors (segment creation/attach, quota, I/O)
//! - Synchronization errors (bounded waits that expired)
//! - Internal errors (bugs, corrupted messages)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for shmforge
#[derive(Debug, thiserror::Error)]
pub enum ShmForgeError {
    // ========== Argument Errors ==========
    /// Generic invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Rank outside `0..group_size`
    #[error("Invalid rank {rank} for group of size {group_size}")]
    InvalidRank { rank: i64, group_size: i64 },

    /// Group size below one or above the supported maximum
    #[error("Invalid group size: {0}")]
    InvalidGroupSize(i64),

    /// Segment name that cannot be used as a file name
    #[error("Invalid segment name: {0:?}")]
    InvalidName(String),

    /// Handle does not refer to a live manager
    #[error("Shared-memory manager handle not found: {0}")]
    HandleNotFound(i64),

    /// Buffer length does not match what the operation expects
    #[error("Size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Tensor element type does not match
    #[error("Dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: String, actual: String },

    /// Element type is not supported by the operation
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// Invalid tensor shape
    #[error("Invalid tensor shape: {0}")]
    InvalidTensorShape(String),

    /// A peer published a different collective or payload length for the same round
    #[error("Collective mismatch with rank {peer}: {detail}")]
    CollectiveMismatch { peer: usize, detail: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Resource Errors ==========
    /// Segment could not be created
    #[error("Shared-memory segment creation failed: {0}")]
    SegmentCreationFailed(String),

    /// Segment could not be opened or mapped
    #[error("Shared-memory segment attach failed: {0}")]
    SegmentAttachFailed(String),

    /// Existing segment has an incompatible layout or size
    #[error("Incompatible shared-memory segment: {0}")]
    IncompatibleSegment(String),

    /// Not enough shared memory to back the segment
    #[error("Shared-memory quota exceeded: {0}")]
    QuotaExceeded(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Synchronization Errors ==========
    /// A peer did not reach the expected round within the configured wait bound
    #[error("Timed out after {waited_ms} ms waiting for rank {peer} during {op}")]
    SynchronizationTimeout {
        op: String,
        peer: usize,
        waited_ms: u64,
    },

    /// Not all ranks attached to the segment within the attach timeout
    #[error("Rendezvous on {name:?} timed out: {attached}/{expected} ranks attached")]
    RendezvousTimeout {
        name: String,
        attached: usize,
        expected: usize,
    },

    // ========== Internal Errors ==========
    /// Point-to-point message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a bug or a panicked peer thread)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ShmForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ShmForgeError::InvalidArgument(_)
            | ShmForgeError::InvalidRank { .. }
            | ShmForgeError::InvalidGroupSize(_)
            | ShmForgeError::InvalidName(_)
            | ShmForgeError::HandleNotFound(_)
            | ShmForgeError::SizeMismatch { .. }
            | ShmForgeError::DtypeMismatch { .. }
            | ShmForgeError::UnsupportedDtype(_)
            | ShmForgeError::InvalidTensorShape(_)
            | ShmForgeError::CollectiveMismatch { .. }
            | ShmForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            ShmForgeError::SegmentCreationFailed(_)
            | ShmForgeError::SegmentAttachFailed(_)
            | ShmForgeError::IncompatibleSegment(_)
            | ShmForgeError::QuotaExceeded(_)
            | ShmForgeError::IoError(_) => ErrorCategory::Resource,

            ShmForgeError::SynchronizationTimeout { .. }
            | ShmForgeError::RendezvousTimeout { .. } => ErrorCategory::Synchronization,

            ShmForgeError::MalformedMessage(_)
            | ShmForgeError::InternalError(_)
            | ShmForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this is a user-facing error (invalid input or usage)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error came from the operating system's shared-memory resources
    pub fn is_resource_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Resource)
    }

    /// Check if a bounded wait expired
    ///
    /// The group is in an unknown state afterwards: peers may still be blocked
    /// in the same round.
    pub fn is_synchronization_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Synchronization)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: fix the call (rank, handle, buffer sizes)
/// - Resource: shared-memory creation, mapping or quota problem
/// - Synchronization: a peer did not show up in time
/// - Internal: report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid argument or usage
    User,
    /// Shared-memory resource failure
    Resource,
    /// Bounded wait expired
    Synchronization,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Synchronization => write!(f, "Synchronization"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error> is derived by #[from] on IoError

impl<T> From<std::sync::PoisonError<T>> for ShmForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ShmForgeError::LockPoisoned(err.to_string())
    }
}

/// Result type alias using ShmForgeError
pub type ForgeResult<T> = std::result::Result<T, ShmForgeError>;

// ========== Helper Macros ==========

/// Create an invalid-argument error with context
///
/// # Examples
/// ```ignore
/// return Err(user_error!("outputs must hold {} tensors", group_size));
/// ```
#[macro_export]
macro_rules! user_error {
    ($msg:expr) => {
        $crate::error::ShmForgeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShmForgeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ShmForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShmForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a segment attach error with context
#[macro_export]
macro_rules! attach_error {
    ($msg:expr) => {
        $crate::error::ShmForgeError::SegmentAttachFailed($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShmForgeError::SegmentAttachFailed(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
///
/// # Examples
/// ```ignore
/// let file = File::open(&path).map_err(|e| io_context(e, "opening segment"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> ShmForgeError {
    ShmForgeError::IoError(std::io::Error::new(
        err.kind(),
        format!("{}: {}", msg, err),
    ))
}
