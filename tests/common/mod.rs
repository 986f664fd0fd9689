//! Common test utilities for multi-rank tests
//!
//! Ranks are simulated with threads of the test process. Each rank maps the
//! segment on its own, exactly like a separate process would, and talks to
//! the others only through shared memory.
//!
//! # Usage
//!
//! ```ignore
//! let dir = create_temp_dir()?;
//! let name = unique_name("allreduce");
//! let results = run_ranks(4, &name, test_config(&dir), |handle, rank| {
//!     // ... collectives on `handle` ...
//! });
//! ```

#![allow(dead_code)]

// Submodules
mod tempfile_helpers;

use once_cell::sync::Lazy;
use shmforge::{
    init_shm_manager_with_config, join_shm_manager, release_shm_manager, ShmConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[allow(unused_imports)]
pub use serial_test::serial;
#[allow(unused_imports)]
pub use tempfile_helpers::{create_temp_dir, TempDir};

/// Install logging once per test binary, honoring `SHMFORGE_LOG_LEVEL`
static TEST_LOGGING: Lazy<()> = Lazy::new(shmforge::logging::init_logging_default);

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Segment name unique within this test run
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Small slots and channels so modest payloads exercise chunking
pub fn test_config(dir: &TempDir) -> ShmConfig {
    Lazy::force(&TEST_LOGGING);
    ShmConfig::new()
        .with_segment_dir(dir.path())
        .with_slot_bytes(1024)
        .with_p2p_bytes(512)
        .with_attach_timeout(Duration::from_secs(30))
        .with_wait_timeout(Some(Duration::from_secs(60)))
        .with_spin_iters(64)
        .with_preallocate(false)
}

/// Run `f(handle, rank)` for every rank of a group on its own thread
///
/// Each thread initializes and joins its rank before calling `f`, and
/// releases it afterwards. Results are returned in rank order.
pub fn run_ranks<R, F>(group_size: i64, name: &str, config: ShmConfig, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(i64, i64) -> R + Sync,
{
    std::thread::scope(|s| {
        let workers: Vec<_> = (0..group_size)
            .map(|rank| {
                let config = config.clone();
                let f = &f;
                s.spawn(move || {
                    let handle = init_shm_manager_with_config(name, group_size, rank, config)
                        .unwrap_or_else(|e| panic!("rank {} init failed: {}", rank, e));
                    assert_eq!(join_shm_manager(handle, name).unwrap(), name);
                    let result = f(handle, rank);
                    release_shm_manager(handle).unwrap();
                    result
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("rank thread panicked"))
            .collect()
    })
}
