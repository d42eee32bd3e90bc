//! Printer adapter interface.
//!
//! An adapter owns one stateful session with one printer. Status arrives on a
//! background listener and is published as immutable [`PrinterSnapshot`]
//! values through a `watch` channel; readers never block on the device.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::ConnectionConfig;
use crate::printer::{AdapterType, Printer};
use crate::status::{CanonicalStatus, ConnectionState, PrinterSnapshot, Progress};

/// Protocol-specific session with a single printer.
///
/// Control methods return whether the request was accepted for transmission.
/// Their effect is confirmed later through the status channel.
#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Open the status and command channels. Returns `false` on any failure.
    async fn connect(&self, config: &ConnectionConfig) -> bool;

    /// Close all channels. Safe to call repeatedly.
    async fn disconnect(&self);

    /// Session state.
    fn connection_state(&self) -> ConnectionState;

    /// Latest snapshot.
    fn snapshot(&self) -> PrinterSnapshot;

    /// Receiver that observes every new snapshot.
    fn subscribe(&self) -> watch::Receiver<PrinterSnapshot>;

    /// Cached canonical status.
    fn status(&self) -> CanonicalStatus {
        self.snapshot().status
    }

    /// Cached progress.
    fn progress(&self) -> Progress {
        self.snapshot().progress
    }

    /// Ask the device for a full status report. The answer arrives on the
    /// status channel.
    async fn refresh(&self) -> bool;

    /// Upload a file to the device.
    async fn send_file(&self, path: &Path) -> bool;

    /// Start printing a previously uploaded file.
    async fn start_print(&self, file_name: &str) -> bool;

    /// Pause the running job.
    async fn pause_print(&self) -> bool;

    /// Resume a paused job.
    async fn resume_print(&self) -> bool;

    /// Stop the running job.
    async fn cancel_print(&self) -> bool;

    /// Description of the most recent failure, if any.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Creates adapters for registered printers.
pub trait AdapterFactory: Send + Sync {
    /// Build an unconnected adapter for `printer`.
    fn create(&self, printer: &Printer) -> Option<Arc<dyn PrinterAdapter>>;

    /// Adapter families this factory supports.
    fn supports(&self, adapter_type: AdapterType) -> bool;
}
