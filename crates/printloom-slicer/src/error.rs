//! Error types for the slicing engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while slicing.
#[derive(Error, Debug)]
pub enum SliceError {
    /// Model file does not exist.
    #[error("model not found: {0}")]
    ModelNotFound(PathBuf),

    /// Slicing parameters were rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Slicer binary could not be started.
    #[error("failed to launch slicer {binary}: {source}")]
    Launch {
        /// Binary path.
        binary: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Slicer exited with a non-zero status.
    #[error("slicer exited with {code:?}: {stderr}")]
    Failed {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Tail of standard error.
        stderr: String,
    },

    /// Slicer ran past the wall-clock limit and was killed.
    #[error("slicer timed out after {0:?}")]
    Timeout(Duration),

    /// Slicer exited cleanly but produced no toolpath.
    #[error("slicer produced no output at {0}")]
    MissingOutput(PathBuf),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Machine definition could not be written.
    #[error("definition error: {0}")]
    Definition(#[from] serde_json::Error),
}

/// Result type for slicing operations.
pub type Result<T> = std::result::Result<T, SliceError>;
