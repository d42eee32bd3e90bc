//! Registered printers and their availability.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::{Result, TaskError};
use crate::profile::PrinterProfile;
use crate::status::CanonicalStatus;
use crate::task::TaskId;

/// Protocol family used to talk to a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    /// Bambu Lab LAN mode (MQTT + FTPS).
    #[default]
    Bambu,
}

/// A printer known to the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    /// Unique printer ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Model name, e.g. "X1C".
    pub model: String,
    /// Adapter family.
    pub adapter_type: AdapterType,
    /// Connection parameters.
    pub connection: ConnectionConfig,
    /// Machine profile used for slicing.
    pub profile: PrinterProfile,
    /// Last canonical status observed.
    pub status: CanonicalStatus,
    /// Task currently assigned, if any.
    pub current_task_id: Option<TaskId>,
    /// Whether the scheduler may use this printer.
    pub enabled: bool,
    /// Last status message received.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// The current `ERROR` status was caused by a job we already failed.
    #[serde(default)]
    pub fault_acknowledged: bool,
    /// Consecutive failed connection attempts.
    #[serde(default)]
    pub connect_failures: u32,
}

impl Printer {
    /// Create an enabled printer with no status yet.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        model: impl Into<String>,
        connection: ConnectionConfig,
        profile: PrinterProfile,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: model.into(),
            adapter_type: AdapterType::Bambu,
            connection,
            profile,
            status: CanonicalStatus::Offline,
            current_task_id: None,
            enabled: true,
            last_heartbeat: None,
            fault_acknowledged: false,
            connect_failures: 0,
        }
    }

    /// Validate registration fields.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TaskError::InvalidPrinter("id is required".into()));
        }
        self.connection.validate()?;
        self.profile.validate()
    }

    /// Whether the heartbeat is younger than `ttl`.
    pub fn heartbeat_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.last_heartbeat.is_some_and(|seen| now - seen <= ttl)
    }

    /// Whether a new job may be dispatched to this printer.
    pub fn is_available(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let status_ok = match self.status {
            CanonicalStatus::Idle => true,
            CanonicalStatus::Error => self.fault_acknowledged,
            _ => false,
        };
        self.enabled && self.current_task_id.is_none() && status_ok && self.heartbeat_fresh(now, ttl)
    }

    /// Apply a fresh status observation.
    pub fn observe(&mut self, status: CanonicalStatus, at: DateTime<Utc>) {
        if status != CanonicalStatus::Error {
            self.fault_acknowledged = false;
        }
        self.status = status;
        self.last_heartbeat = Some(at);
    }

    /// Attach a task. Fails when another task already holds the printer.
    pub fn assign(&mut self, task_id: TaskId) -> Result<()> {
        match self.current_task_id {
            Some(current) if current != task_id => Err(TaskError::InvalidPrinter(format!(
                "printer {} already runs task {current}",
                self.id
            ))),
            _ => {
                self.current_task_id = Some(task_id);
                Ok(())
            }
        }
    }

    /// Detach the task, if it is the one assigned.
    pub fn release(&mut self, task_id: TaskId) {
        if self.current_task_id == Some(task_id) {
            self.current_task_id = None;
        }
    }
}
