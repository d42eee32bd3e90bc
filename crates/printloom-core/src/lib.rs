//! Domain model for the printloom print-execution pipeline.
//!
//! Tasks move from a source model through slicing, packaging and a durable
//! priority queue onto a printer. This crate holds the value objects, the
//! task and printer aggregates, and the [`PrinterAdapter`] seam that protocol
//! crates implement.
//!
//! # Example
//!
//! ```
//! use printloom_core::{PrintTask, SlicingConfig, TaskStatus};
//!
//! let mut task = PrintTask::new("models/cube.stl", "x1c-1", SlicingConfig::fast(), 5);
//! assert_eq!(task.status, TaskStatus::Pending);
//! task.start_slicing().unwrap();
//! assert_eq!(task.status, TaskStatus::Slicing);
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod printer;
pub mod profile;
pub mod status;
pub mod task;

pub use adapter::{AdapterFactory, PrinterAdapter};
pub use config::{AdhesionType, ConnectionConfig, MaterialType, SlicingConfig, SlicingConfigBuilder};
pub use error::{Result, TaskError};
pub use printer::{AdapterType, Printer};
pub use profile::{FirmwareFlavor, PrinterProfile};
pub use status::{CanonicalStatus, ConnectionState, PrinterSnapshot, Progress};
pub use task::{
    ControlCommand, FailureKind, PendingCommand, PrintTask, QueueKey, SliceOutcome, TaskFailure,
    TaskId, TaskStatus,
};
