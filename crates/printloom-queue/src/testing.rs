//! Fakes shared by the scheduler and service tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use printloom_core::{
    AdapterFactory, AdapterType, CanonicalStatus, ConnectionConfig, ConnectionState, PrintTask,
    Printer, PrinterAdapter, PrinterProfile, PrinterSnapshot, SliceOutcome, SlicingConfig, TaskId,
};
use tokio::sync::watch;

use crate::store::Store;

/// Scripted printer.
pub struct FakeAdapter {
    state: Mutex<ConnectionState>,
    snapshot: watch::Sender<PrinterSnapshot>,
    pub connect_ok: AtomicBool,
    pub send_ok: AtomicBool,
    pub start_ok: AtomicBool,
    pub cancel_ok: AtomicBool,
    /// Stop, pause and resume take effect on the status channel.
    pub obey: AtomicBool,
    pub uploads: Mutex<Vec<PathBuf>>,
    pub started: Mutex<Vec<String>>,
    pub cancels: AtomicUsize,
    pub refreshes: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            snapshot: watch::Sender::new(PrinterSnapshot::offline()),
            connect_ok: AtomicBool::new(true),
            send_ok: AtomicBool::new(true),
            start_ok: AtomicBool::new(true),
            cancel_ok: AtomicBool::new(true),
            obey: AtomicBool::new(false),
            uploads: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Publish a report.
    pub fn report(&self, status: CanonicalStatus, finished: bool, percentage: u8) {
        self.snapshot.send_modify(|s| {
            s.status = status;
            s.finished = finished;
            s.progress.percentage = percentage;
            s.error_code = (status == CanonicalStatus::Error).then_some(0x0300_4000);
            s.sequence += 1;
            s.received_at = Some(Utc::now());
        });
    }

    /// Drop the status channel.
    pub fn drop_channel(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.snapshot.send_modify(|s| s.status = CanonicalStatus::Offline);
    }

    /// Backdate the last report without publishing a new one.
    pub fn age(&self, by: chrono::Duration) {
        self.snapshot.send_modify(|s| {
            s.received_at = s.received_at.map(|at| at - by);
        });
    }

    fn obeying(&self) -> bool {
        self.obey.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrinterAdapter for FakeAdapter {
    async fn connect(&self, _config: &ConnectionConfig) -> bool {
        if !self.connect_ok.load(Ordering::SeqCst) {
            return false;
        }
        *self.state.lock().unwrap() = ConnectionState::Connected;
        if self.snapshot.borrow().received_at.is_none() {
            self.report(CanonicalStatus::Idle, false, 0);
        }
        true
    }

    async fn disconnect(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn snapshot(&self) -> PrinterSnapshot {
        self.snapshot.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PrinterSnapshot> {
        self.snapshot.subscribe()
    }

    async fn refresh(&self) -> bool {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.connection_state() != ConnectionState::Connected {
            return false;
        }
        let current = self.snapshot();
        self.report(current.status, current.finished, current.progress.percentage);
        true
    }

    async fn send_file(&self, path: &Path) -> bool {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        self.send_ok.load(Ordering::SeqCst)
    }

    async fn start_print(&self, file_name: &str) -> bool {
        self.started.lock().unwrap().push(file_name.to_string());
        self.start_ok.load(Ordering::SeqCst)
    }

    async fn pause_print(&self) -> bool {
        if self.obeying() {
            self.report(CanonicalStatus::Paused, false, self.snapshot().progress.percentage);
        }
        true
    }

    async fn resume_print(&self) -> bool {
        if self.obeying() {
            self.report(CanonicalStatus::Busy, false, self.snapshot().progress.percentage);
        }
        true
    }

    async fn cancel_print(&self) -> bool {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.obeying() {
            self.report(CanonicalStatus::Error, false, 0);
        }
        self.cancel_ok.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<String> {
        Some("scripted failure".into())
    }
}

/// Hands out pre-built fakes by printer ID.
#[derive(Default)]
pub struct FakeFactory {
    adapters: HashMap<String, Arc<FakeAdapter>>,
}

impl FakeFactory {
    pub fn with(mut self, printer_id: &str, adapter: Arc<FakeAdapter>) -> Self {
        self.adapters.insert(printer_id.to_string(), adapter);
        self
    }
}

impl AdapterFactory for FakeFactory {
    fn create(&self, printer: &Printer) -> Option<Arc<dyn PrinterAdapter>> {
        let adapter = self.adapters.get(&printer.id)?.clone();
        Some(adapter)
    }

    fn supports(&self, adapter_type: AdapterType) -> bool {
        adapter_type == AdapterType::Bambu
    }
}

pub fn printer(id: &str) -> Printer {
    Printer::new(
        id,
        format!("Printer {id}"),
        "X1C",
        ConnectionConfig::new("192.168.1.20", "01P00A123", "12345678"),
        PrinterProfile::bambu_x1c(),
    )
}

/// Store a sliced and packaged task, then queue it.
pub fn queued_task(store: &Store, printer_id: &str, priority: i32) -> TaskId {
    let mut task = PrintTask::new("cube.stl", printer_id, SlicingConfig::standard(), priority);
    task.start_slicing().unwrap();
    task.record_slice(SliceOutcome {
        toolpath_path: PathBuf::from(format!("{}.gcode", task.id)),
        estimated_duration_secs: 900,
        estimated_material_g: 5.5,
        total_layers: 120,
    })
    .unwrap();
    task.record_container(PathBuf::from(format!("/jobs/{}.gcode.3mf", task.id)))
        .unwrap();
    store.insert_task(&task).unwrap();
    store.enqueue(task.id, priority).unwrap();
    task.id
}
