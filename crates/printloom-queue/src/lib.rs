//! Durable print queue and scheduler for printloom.
//!
//! - [`Store`]: redb tables for tasks, printers and the queue index
//! - [`PrintQueue`]: priority queue ordered by `(-priority, sequence)`
//! - [`Scheduler`]: periodic loop that dispatches queued tasks to idle
//!   printers and follows them to completion
//! - [`PrintService`]: task creation, inspection and control
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use printloom_bambu::BambuAdapterFactory;
//! use printloom_core::SlicingConfig;
//! use printloom_queue::{AppConfig, PrintService};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AppConfig::load(Some("printloom.toml".as_ref()))?;
//! let factory = Arc::new(BambuAdapterFactory::new(config.printer.adapter_options()));
//! let service = PrintService::from_config(&config, factory)?;
//!
//! let shutdown = CancellationToken::new();
//! let scheduler = service.start(shutdown.clone()).await?;
//! let id = service
//!     .create_task("models/cube.stl", "x1c-1", SlicingConfig::standard(), 0)
//!     .await?;
//! println!("{:?}", service.get_task(id)?);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, PrinterLinkConfig, SchedulerConfig};
pub use error::{ConfigError, SchedulerError, StoreError, StoreResult};
pub use queue::{PrintQueue, QueueEntry, QueueStatus, DEFAULT_STATUS_DEPTH};
pub use registry::AdapterRegistry;
pub use scheduler::{Recovery, Scheduler, TickReport};
pub use service::PrintService;
pub use store::Store;
