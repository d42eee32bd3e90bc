//! [`PrinterAdapter`] for Bambu Lab printers in LAN mode.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use printloom_core::{
    AdapterFactory, AdapterType, CanonicalStatus, ConnectionConfig, ConnectionState, Printer,
    PrinterAdapter, PrinterSnapshot,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::PrinterCommand;
use crate::ftps::FtpsTransfer;
use crate::mqtt::MqttBus;
use crate::status::merge_report;
use crate::tls::device_client_config;
use crate::transport::{BusEvent, CommandSink, FileTransfer, MessageBus};

/// Timeouts for the LAN transports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterOptions {
    /// Limit for opening the status channel.
    pub connect_timeout: Duration,
    /// Limit for one upload or file check.
    pub transfer_timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(300),
        }
    }
}

struct Session {
    config: ConnectionConfig,
    sink: Arc<dyn CommandSink>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

/// Stateful session with one Bambu printer.
///
/// A background listener merges reports into an immutable
/// [`PrinterSnapshot`] and publishes it on a `watch` channel; it is the only
/// writer while a session is open.
pub struct BambuAdapter {
    bus: Arc<dyn MessageBus>,
    files: Arc<dyn FileTransfer>,
    connect_timeout: Duration,
    snapshot: Arc<watch::Sender<PrinterSnapshot>>,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<Session>>,
    last_error: std::sync::Mutex<Option<String>>,
    sequence: AtomicU64,
}

impl BambuAdapter {
    /// Create an adapter over explicit transports.
    pub fn new(bus: Arc<dyn MessageBus>, files: Arc<dyn FileTransfer>, connect_timeout: Duration) -> Self {
        let (snapshot, _) = watch::channel(PrinterSnapshot::offline());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            bus,
            files,
            connect_timeout,
            snapshot: Arc::new(snapshot),
            state: Arc::new(state),
            session: Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Create an adapter using MQTT and implicit FTPS over TLS.
    pub fn lan(options: AdapterOptions) -> Self {
        let tls = device_client_config();
        Self::new(
            Arc::new(MqttBus::new(tls.clone(), options.connect_timeout)),
            Arc::new(FtpsTransfer::new(tls, options.transfer_timeout)),
            options.connect_timeout,
        )
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "bambu adapter");
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(message);
        }
    }

    fn clear_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    fn mark_offline(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.status = CanonicalStatus::Offline;
            snapshot.finished = false;
        });
    }

    async fn teardown(session: Session) {
        session.cancel.cancel();
        session.sink.close().await;
        let _ = session.listener.await;
    }

    /// Connection and sink of the open session.
    async fn active(&self) -> Option<(ConnectionConfig, Arc<dyn CommandSink>)> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        let session = self.session.lock().await;
        session.as_ref().map(|s| (s.config.clone(), s.sink.clone()))
    }

    async fn publish(&self, command: PrinterCommand) -> bool {
        let Some((config, sink)) = self.active().await else {
            self.record_error(format!("cannot send {}: not connected", command.verb()));
            return false;
        };

        let payload = command
            .to_json(self.sequence.fetch_add(1, Ordering::Relaxed))
            .to_string();
        match sink.publish(payload).await {
            Ok(()) => {
                if command == PrinterCommand::PushAll {
                    tracing::debug!(serial = %config.serial, "status refresh requested");
                } else {
                    tracing::info!(serial = %config.serial, command = command.verb(), "command published");
                }
                true
            }
            Err(e) => {
                self.record_error(format!("publish {} failed: {e}", command.verb()));
                false
            }
        }
    }
}

async fn listen(
    mut events: mpsc::Receiver<BusEvent>,
    snapshot: Arc<watch::Sender<PrinterSnapshot>>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    serial: String,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(BusEvent::Report(payload)) => {
                let next = {
                    let current = snapshot.borrow();
                    merge_report(&current, &payload, Utc::now())
                };
                match next {
                    Some(next) => {
                        snapshot.send_replace(next);
                    }
                    None => tracing::debug!(serial = %serial, "dropping malformed report"),
                }
            }
            Some(BusEvent::Closed(reason)) => {
                tracing::warn!(serial = %serial, reason = %reason, "status channel closed");
                break;
            }
            None => break,
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    snapshot.send_modify(|s| {
        s.status = CanonicalStatus::Offline;
        s.finished = false;
    });
}

#[async_trait]
impl PrinterAdapter for BambuAdapter {
    async fn connect(&self, config: &ConnectionConfig) -> bool {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.config == *config && *self.state.borrow() == ConnectionState::Connected {
                return true;
            }
        }
        if let Some(stale) = session.take() {
            Self::teardown(stale).await;
        }

        self.clear_error();
        if let Err(e) = config.validate() {
            self.record_error(e.to_string());
            return false;
        }

        self.state.send_replace(ConnectionState::Connecting);
        let opened = tokio::time::timeout(self.connect_timeout, self.bus.open(config)).await;
        let connection = match opened {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                self.record_error(format!("connect to {} failed: {e}", config.host));
                return false;
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                self.record_error(format!("connect to {} timed out", config.host));
                return false;
            }
        };

        self.state.send_replace(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            connection.events,
            self.snapshot.clone(),
            self.state.clone(),
            cancel.clone(),
            config.serial.clone(),
        ));

        let pushall = PrinterCommand::PushAll
            .to_json(self.sequence.fetch_add(1, Ordering::Relaxed))
            .to_string();
        if let Err(e) = connection.sink.publish(pushall).await {
            tracing::warn!(serial = %config.serial, error = %e, "pushall request failed");
        }

        tracing::info!(host = %config.host, serial = %config.serial, "connected");
        *session = Some(Session {
            config: config.clone(),
            sink: connection.sink,
            cancel,
            listener,
        });
        true
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            tracing::info!(serial = %session.config.serial, "disconnecting");
            Self::teardown(session).await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        self.mark_offline();
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn snapshot(&self) -> PrinterSnapshot {
        self.snapshot.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PrinterSnapshot> {
        self.snapshot.subscribe()
    }

    async fn refresh(&self) -> bool {
        self.publish(PrinterCommand::PushAll).await
    }

    async fn send_file(&self, path: &Path) -> bool {
        let Some((config, _)) = self.active().await else {
            self.record_error("cannot upload: not connected");
            return false;
        };
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            self.record_error(format!("not a file: {}", path.display()));
            return false;
        };
        let local_len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.record_error(format!("cannot read {}: {e}", path.display()));
                return false;
            }
        };

        match self.files.upload(&config, path, &name).await {
            Ok(()) => {
                tracing::info!(serial = %config.serial, file = %name, bytes = local_len, "uploaded");
                true
            }
            Err(e) if e.is_transient_transfer() => {
                tracing::warn!(serial = %config.serial, file = %name, error = %e, "upload ended with a transient reply, verifying");
                match self.files.remote_size(&config, &name).await {
                    Ok(Some(size)) if size == local_len => {
                        tracing::info!(serial = %config.serial, file = %name, "file present on device");
                        true
                    }
                    Ok(found) => {
                        self.record_error(format!(
                            "upload of {name} failed ({e}); device has {found:?} bytes, expected {local_len}"
                        ));
                        false
                    }
                    Err(verify) => {
                        self.record_error(format!("upload of {name} failed ({e}); verification failed: {verify}"));
                        false
                    }
                }
            }
            Err(e) => {
                self.record_error(format!("upload of {name} failed: {e}"));
                false
            }
        }
    }

    async fn start_print(&self, file_name: &str) -> bool {
        self.publish(PrinterCommand::project_file(file_name)).await
    }

    async fn pause_print(&self) -> bool {
        self.publish(PrinterCommand::Pause).await
    }

    async fn resume_print(&self) -> bool {
        self.publish(PrinterCommand::Resume).await
    }

    async fn cancel_print(&self) -> bool {
        self.publish(PrinterCommand::Stop).await
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Drop for BambuAdapter {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.cancel.cancel();
        }
    }
}

/// Builds [`BambuAdapter`]s for registered printers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BambuAdapterFactory {
    options: AdapterOptions,
}

impl BambuAdapterFactory {
    /// Create a factory with the given transport timeouts.
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }
}

impl AdapterFactory for BambuAdapterFactory {
    fn create(&self, printer: &Printer) -> Option<Arc<dyn PrinterAdapter>> {
        if !self.supports(printer.adapter_type) {
            return None;
        }
        Some(Arc::new(BambuAdapter::lan(self.options)))
    }

    fn supports(&self, adapter_type: AdapterType) -> bool {
        adapter_type == AdapterType::Bambu
    }
}
