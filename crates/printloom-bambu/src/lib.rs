//! Bambu Lab printer integration for printloom.
//!
//! This crate provides:
//! - [`BambuAdapter`], a [`printloom_core::PrinterAdapter`] over MQTT status
//!   reports and implicit FTPS uploads
//! - `.gcode.3mf` packaging of sliced toolpaths ([`threemf`])
//! - Print control (start, pause, resume, stop)
//!
//! # Example
//!
//! ```ignore
//! use printloom_bambu::{threemf, AdapterOptions, BambuAdapter};
//! use printloom_core::{ConnectionConfig, PrinterAdapter};
//!
//! let container = threemf::wrap("cube.gcode".as_ref(), &Default::default())?;
//!
//! let adapter = BambuAdapter::lan(AdapterOptions::default());
//! let config = ConnectionConfig::new("192.168.1.20", "01P00A123456789", "12345678");
//! if adapter.connect(&config).await && adapter.send_file(&container).await {
//!     adapter.start_print("cube.gcode.3mf").await;
//! }
//! println!("{}", adapter.status());
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod commands;
pub mod error;
pub mod ftps;
pub mod mqtt;
pub mod status;
pub mod threemf;
pub mod tls;
pub mod transport;

pub use adapter::{AdapterOptions, BambuAdapter, BambuAdapterFactory};
pub use commands::PrinterCommand;
pub use error::{BambuError, Result};
pub use status::{map_gcode_state, merge_report, GcodeState};
pub use threemf::ContainerMetadata;
pub use transport::{BusConnection, BusEvent, CommandSink, FileTransfer, MessageBus};
