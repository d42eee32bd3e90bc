//! Error types for the queue, scheduler and service layers.

use std::path::PathBuf;

use printloom_core::{TaskError, TaskId};
use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database could not be opened.
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction could not be started.
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table could not be opened.
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Read or write failed.
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    /// Commit failed.
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No task with this ID.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// No printer with this ID.
    #[error("Printer not found: {0}")]
    PrinterNotFound(String),

    /// A second live task was about to be attached to a printer.
    #[error("Printer {printer_id} already runs task {current}; refusing {requested}")]
    DuplicateAssignment {
        /// Printer ID.
        printer_id: String,
        /// Task holding the printer.
        current: TaskId,
        /// Task that asked for it.
        requested: TaskId,
    },

    /// The stored task rejected the transition.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the scheduler and the print service.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rejected task transition or invalid input.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Model file does not exist.
    #[error("Model not found: {0}")]
    ModelNotFound(PathBuf),

    /// No adapter could be built or found for a printer.
    #[error("No adapter for printer {0}")]
    NoAdapter(String),

    /// The printer did not accept a command.
    #[error("Printer {printer_id} rejected {command}: {reason}")]
    CommandRejected {
        /// Printer ID.
        printer_id: String,
        /// Command name.
        command: &'static str,
        /// Adapter's description of the failure.
        reason: String,
    },

    /// The printer accepted a command but never showed its effect.
    #[error("Printer {printer_id} did not confirm {command}")]
    Unconfirmed {
        /// Printer ID.
        printer_id: String,
        /// Command name.
        command: &'static str,
    },
}

/// Errors loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::AppConfig`].
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
