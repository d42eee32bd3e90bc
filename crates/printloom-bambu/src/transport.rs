//! Transport seams used by [`crate::BambuAdapter`].
//!
//! Production code uses [`crate::mqtt::MqttBus`] and [`crate::ftps::FtpsTransfer`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use printloom_core::ConnectionConfig;
use tokio::sync::mpsc;

use crate::error::Result;

/// Inbound event from the status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Raw report payload.
    Report(Vec<u8>),
    /// The channel failed and will deliver nothing more.
    Closed(String),
}

/// Outbound half of an open status channel.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Publish a command payload. Returns once the transport accepted it.
    async fn publish(&self, payload: String) -> Result<()>;

    /// Close the channel.
    async fn close(&self);
}

/// An open status channel.
pub struct BusConnection {
    /// Publishes commands.
    pub sink: Arc<dyn CommandSink>,
    /// Reports in receipt order.
    pub events: mpsc::Receiver<BusEvent>,
}

/// Opens status channels.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connect, authenticate and subscribe to the device's report topic.
    async fn open(&self, config: &ConnectionConfig) -> Result<BusConnection>;
}

/// Moves files onto the device.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Upload `local` as `remote_name`.
    async fn upload(&self, config: &ConnectionConfig, local: &Path, remote_name: &str) -> Result<()>;

    /// Size of a file on the device, `None` if absent.
    async fn remote_size(&self, config: &ConnectionConfig, remote_name: &str) -> Result<Option<u64>>;
}
