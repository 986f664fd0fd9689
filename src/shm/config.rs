//! Configuration for shared-memory managers
//!
//! [`ShmConfig`] controls where segments live, how large the per-rank staging
//! slots and point-to-point channels are, and how long blocking calls wait.
//! Every rank of a group must use the same slot and channel sizes; a joiner
//! with different sizes is rejected with `IncompatibleSegment`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ForgeResult, ShmForgeError};

use super::layout::CACHE_LINE;

const SEGMENT_DIR_ENV: &str = "SHMFORGE_SEGMENT_DIR";
const SLOT_BYTES_ENV: &str = "SHMFORGE_SLOT_BYTES";
const P2P_BYTES_ENV: &str = "SHMFORGE_P2P_BYTES";
const ATTACH_TIMEOUT_ENV: &str = "SHMFORGE_ATTACH_TIMEOUT_MS";
const WAIT_TIMEOUT_ENV: &str = "SHMFORGE_WAIT_TIMEOUT_MS";
const SPIN_ITERS_ENV: &str = "SHMFORGE_SPIN_ITERS";
const PREALLOCATE_ENV: &str = "SHMFORGE_PREALLOCATE";

/// Default per-rank collective slot size
pub const DEFAULT_SLOT_BYTES: usize = 1024 * 1024;

/// Default per-channel point-to-point buffer size
pub const DEFAULT_P2P_BYTES: usize = 256 * 1024;

/// Configuration for a shared-memory manager
#[derive(Debug, Clone, PartialEq)]
pub struct ShmConfig {
    /// Directory holding segment files (a tmpfs such as `/dev/shm` in production)
    pub segment_dir: PathBuf,

    /// Bytes of staging space per rank for collectives
    pub slot_bytes: usize,

    /// Bytes of buffer space per `(src, dst)` point-to-point channel
    pub p2p_bytes: usize,

    /// How long non-creator ranks wait for the segment to appear, and how
    /// long `join` waits for all ranks to attach
    pub attach_timeout: Duration,

    /// Upper bound on any single wait inside a collective; `None` waits forever
    pub wait_timeout: Option<Duration>,

    /// Busy-wait iterations before falling back to a futex wait
    pub spin_iters: u32,

    /// Reserve the segment's backing memory up front so quota problems
    /// surface at init rather than as SIGBUS on first touch
    pub preallocate: bool,

    /// Chunks with at least this many elements are reduced with rayon
    pub parallel_reduce_threshold: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            segment_dir: default_segment_dir(),
            slot_bytes: DEFAULT_SLOT_BYTES,
            p2p_bytes: DEFAULT_P2P_BYTES,
            attach_timeout: Duration::from_secs(60),
            wait_timeout: None,
            spin_iters: 2048,
            preallocate: true,
            parallel_reduce_threshold: 64 * 1024,
        }
    }
}

impl ShmConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_dir(mut self, segment_dir: impl Into<PathBuf>) -> Self {
        self.segment_dir = segment_dir.into();
        self
    }

    pub fn with_slot_bytes(mut self, slot_bytes: usize) -> Self {
        self.slot_bytes = slot_bytes;
        self
    }

    pub fn with_p2p_bytes(mut self, p2p_bytes: usize) -> Self {
        self.p2p_bytes = p2p_bytes;
        self
    }

    pub fn with_attach_timeout(mut self, attach_timeout: Duration) -> Self {
        self.attach_timeout = attach_timeout;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Option<Duration>) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_spin_iters(mut self, spin_iters: u32) -> Self {
        self.spin_iters = spin_iters;
        self
    }

    pub fn with_preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }

    pub fn with_parallel_reduce_threshold(mut self, threshold: usize) -> Self {
        self.parallel_reduce_threshold = threshold;
        self
    }

    /// Defaults overridden by `SHMFORGE_*` environment variables
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a variable is set but unparsable,
    /// or if the resulting config fails [`validate`](Self::validate).
    pub fn from_env() -> ForgeResult<Self> {
        let mut config = ShmConfig::default();

        if let Ok(dir) = std::env::var(SEGMENT_DIR_ENV) {
            config.segment_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_number(SLOT_BYTES_ENV)? {
            config.slot_bytes = v as usize;
        }
        if let Some(v) = env_number(P2P_BYTES_ENV)? {
            config.p2p_bytes = v as usize;
        }
        if let Some(ms) = env_number(ATTACH_TIMEOUT_ENV)? {
            config.attach_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number(WAIT_TIMEOUT_ENV)? {
            config.wait_timeout = if ms == 0 {
                None
            } else {
                Some(Duration::from_millis(ms))
            };
        }
        if let Some(v) = env_number(SPIN_ITERS_ENV)? {
            config.spin_iters = u32::try_from(v).map_err(|_| {
                ShmForgeError::InvalidConfiguration(format!("{} out of range: {}", SPIN_ITERS_ENV, v))
            })?;
        }
        if let Ok(v) = std::env::var(PREALLOCATE_ENV) {
            config.preallocate = parse_bool(PREALLOCATE_ENV, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the sizes are usable
    pub fn validate(&self) -> ForgeResult<()> {
        if self.slot_bytes < CACHE_LINE {
            return Err(ShmForgeError::InvalidConfiguration(format!(
                "slot_bytes must be at least {} bytes, got {}",
                CACHE_LINE, self.slot_bytes
            )));
        }
        if self.p2p_bytes < CACHE_LINE {
            return Err(ShmForgeError::InvalidConfiguration(format!(
                "p2p_bytes must be at least {} bytes, got {}",
                CACHE_LINE, self.p2p_bytes
            )));
        }
        if self.segment_dir.as_os_str().is_empty() {
            return Err(ShmForgeError::InvalidConfiguration(
                "segment_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_segment_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn env_number(key: &str) -> ForgeResult<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| {
            ShmForgeError::InvalidConfiguration(format!("{}={:?}: {}", key, raw, e))
        }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &str, raw: &str) -> ForgeResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ShmForgeError::InvalidConfiguration(format!(
            "{}={:?}: expected a boolean",
            key, raw
        ))),
    }
}
