//! Helper functions for tempfile/tempdir usage in tests
//!
//! Wrappers around the tempfile crate with consistent error context.

use anyhow::Context;
use std::path::PathBuf;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Path for a JSON log file inside `dir`
pub fn log_file_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("tuneforge_test.log")
}
