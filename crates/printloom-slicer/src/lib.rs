//! External slicer integration for printloom.
//!
//! Runs CuraEngine or OrcaSlicer in its own process group with a hard
//! wall-clock limit, then reads the statistics the slicer embeds in the
//! toolpath. Missing statistics are filled in by a documented approximation
//! (see [`stats::estimate`]).
//!
//! # Example
//!
//! ```ignore
//! use printloom_slicer::{SlicerEngine, SlicerOptions};
//! use printloom_core::{PrinterProfile, SlicingConfig};
//!
//! let slicer = SlicerOptions { engine: SlicerEngine::Orca, ..Default::default() }.into_slicer();
//! let result = slicer
//!     .slice("cube.stl".as_ref(), &PrinterProfile::bambu_x1c(), &SlicingConfig::standard(), "cube.gcode".as_ref())
//!     .await?;
//! println!("{} layers, {:?}", result.total_layers, result.estimated_duration);
//! ```

#![warn(missing_docs)]

pub mod definition;
pub mod engine;
pub mod error;
pub mod orca;
pub mod stats;

pub use engine::{CuraEngineSlicer, Slicer, SlicerEngine, SlicerOptions, ToolpathResult, DEFAULT_TIMEOUT};
pub use orca::OrcaSlicer;
pub use error::{Result, SliceError};
pub use stats::{ParsedStats, ToolpathStats};
