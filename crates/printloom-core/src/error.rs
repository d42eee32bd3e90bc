//! Error types for the domain model.

use thiserror::Error;

use crate::task::TaskStatus;

/// Errors raised by domain-level operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The requested status transition is not allowed.
    #[error("cannot {action}: task is {from}")]
    InvalidTransition {
        /// Operation that was attempted.
        action: &'static str,
        /// Status the task was in.
        from: TaskStatus,
    },

    /// Progress outside 0..=100.
    #[error("progress must be between 0 and 100, got {0}")]
    ProgressOutOfRange(u32),

    /// Slicing config failed validation.
    #[error("invalid slicing config: {0}")]
    InvalidConfig(String),

    /// Printer registration failed validation.
    #[error("invalid printer: {0}")]
    InvalidPrinter(String),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, TaskError>;
