//! Helper functions for tempdir usage in tests
//!
//! Every test gets its own segment directory so that leftover segment files
//! from a failed test can never be picked up by another one.

use anyhow::Context;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("shmforge-test-")
        .tempdir()
        .context("Failed to create temporary segment directory for test")
}

pub use tempfile::TempDir;
