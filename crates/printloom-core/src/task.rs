//! The print task aggregate.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SlicingConfig;
use crate::error::{Result, TaskError};
use crate::status::Progress;

/// Task identifier.
pub type TaskId = Uuid;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Created, not yet sliced.
    Pending,
    /// Slicing and packaging in progress.
    Slicing,
    /// Waiting in the durable queue.
    Queued,
    /// Dequeued and being handed to a printer.
    Dispatching,
    /// Running on a printer.
    Printing,
    /// Paused on the printer.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a user.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Slicing => "SLICING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Dispatching => "DISPATCHING",
            TaskStatus::Printing => "PRINTING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Printer could not be reached.
    Connection,
    /// File upload failed.
    Transfer,
    /// Slicer rejected the input or crashed.
    Slicing,
    /// Toolpath could not be packaged.
    Conversion,
    /// A control command was sent but never confirmed by a status update.
    CommandUnconfirmed,
    /// A cancel command was sent but never confirmed by a status update.
    CancelUnconfirmed,
    /// The device reported a failure.
    Device,
    /// Internal error.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Human-readable failure attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Message shown to users.
    pub message: String,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Durable queue ordering key. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    /// Priority; higher runs first.
    pub priority: i32,
    /// Global insertion sequence; breaks ties FIFO.
    pub sequence: u64,
}

/// Control command awaiting confirmation from the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// `project_file`
    Start,
    /// `pause`
    Pause,
    /// `resume`
    Resume,
    /// `stop`
    Cancel,
}

/// A command sent to the printer whose effect has not been observed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Command sent.
    pub command: ControlCommand,
    /// When it was sent.
    pub issued_at: DateTime<Utc>,
}

/// Slicer output recorded on the task.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceOutcome {
    /// Toolpath file.
    pub toolpath_path: PathBuf,
    /// Estimated duration in seconds.
    pub estimated_duration_secs: u64,
    /// Estimated material in grams.
    pub estimated_material_g: f64,
    /// Total layer count.
    pub total_layers: u32,
}

/// A unit of print work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintTask {
    /// Task ID.
    pub id: TaskId,
    /// Source model reference (file path or storage key).
    pub model_ref: String,
    /// Target printer.
    pub printer_id: String,
    /// Queue priority; higher runs first.
    pub priority: i32,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Slicing parameters.
    pub slicing_config: SlicingConfig,
    /// 1-based position in the queue while queued.
    pub queue_position: Option<u32>,
    /// Durable queue key, kept through dispatch so a requeue restores order.
    pub queue_key: Option<QueueKey>,
    /// Sliced toolpath.
    pub toolpath_path: Option<PathBuf>,
    /// Packaged container uploaded to the device.
    pub container_path: Option<PathBuf>,
    /// Estimated print duration in seconds.
    pub estimated_duration_secs: Option<u64>,
    /// Estimated material in grams.
    pub estimated_material_g: Option<f64>,
    /// Progress percentage (0-100).
    pub progress: u8,
    /// Current layer.
    pub current_layer: u32,
    /// Total layers.
    pub total_layers: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When printing started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Most recent error.
    pub last_error: Option<TaskFailure>,
    /// Number of dispatch attempts so far.
    pub attempts: u32,
    /// The device has been seen running this job.
    pub running_observed: bool,
    /// Command awaiting confirmation.
    pub pending_command: Option<PendingCommand>,
}

impl PrintTask {
    /// Create a new pending task.
    pub fn new(
        model_ref: impl Into<String>,
        printer_id: impl Into<String>,
        slicing_config: SlicingConfig,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            model_ref: model_ref.into(),
            printer_id: printer_id.into(),
            priority,
            status: TaskStatus::Pending,
            slicing_config,
            queue_position: None,
            queue_key: None,
            toolpath_path: None,
            container_path: None,
            estimated_duration_secs: None,
            estimated_material_g: None,
            progress: 0,
            current_layer: 0,
            total_layers: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            last_error: None,
            attempts: 0,
            running_observed: false,
            pending_command: None,
        }
    }

    fn invalid(&self, action: &'static str) -> TaskError {
        TaskError::InvalidTransition {
            action,
            from: self.status,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the task is finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Begin slicing. Re-entering from `SLICING` is allowed for crash recovery.
    pub fn start_slicing(&mut self) -> Result<()> {
        if !matches!(self.status, TaskStatus::Pending | TaskStatus::Slicing) {
            return Err(self.invalid("start slicing"));
        }
        self.status = TaskStatus::Slicing;
        self.touch();
        Ok(())
    }

    /// Record slicer output.
    pub fn record_slice(&mut self, outcome: SliceOutcome) -> Result<()> {
        if self.status != TaskStatus::Slicing {
            return Err(self.invalid("record slice"));
        }
        self.toolpath_path = Some(outcome.toolpath_path);
        self.estimated_duration_secs = Some(outcome.estimated_duration_secs);
        self.estimated_material_g = Some(outcome.estimated_material_g);
        self.total_layers = outcome.total_layers;
        self.touch();
        Ok(())
    }

    /// Record the packaged container.
    pub fn record_container(&mut self, path: PathBuf) -> Result<()> {
        if self.status != TaskStatus::Slicing || self.toolpath_path.is_none() {
            return Err(self.invalid("record container"));
        }
        self.container_path = Some(path);
        self.touch();
        Ok(())
    }

    /// Enter the queue (first time after slicing, or again after a dispatch miss).
    pub fn enqueue(&mut self, key: QueueKey, position: u32) -> Result<()> {
        let ready = match self.status {
            TaskStatus::Slicing => self.container_path.is_some(),
            TaskStatus::Dispatching => true,
            _ => false,
        };
        if !ready {
            return Err(self.invalid("enqueue"));
        }
        self.status = TaskStatus::Queued;
        self.priority = key.priority;
        self.queue_key = Some(key);
        self.queue_position = Some(position);
        self.touch();
        Ok(())
    }

    /// Refresh the cached queue position.
    pub fn set_queue_position(&mut self, position: u32) {
        if self.status == TaskStatus::Queued {
            self.queue_position = Some(position);
        }
    }

    /// Leave the queue to be handed to a printer.
    ///
    /// Does not count as an attempt: the task may go straight back if the
    /// printer turns out to be unavailable.
    pub fn begin_dispatch(&mut self) -> Result<()> {
        if self.status != TaskStatus::Queued {
            return Err(self.invalid("dispatch"));
        }
        self.status = TaskStatus::Dispatching;
        self.queue_position = None;
        self.touch();
        Ok(())
    }

    /// Count a hand-off that claimed its printer.
    pub fn record_attempt(&mut self) -> Result<()> {
        if self.status != TaskStatus::Dispatching {
            return Err(self.invalid("record attempt"));
        }
        self.attempts += 1;
        self.touch();
        Ok(())
    }

    /// The printer accepted the start command.
    pub fn start_printing(&mut self) -> Result<()> {
        if self.status != TaskStatus::Dispatching {
            return Err(self.invalid("start printing"));
        }
        let now = Utc::now();
        self.status = TaskStatus::Printing;
        self.queue_key = None;
        self.started_at = Some(now);
        self.running_observed = false;
        self.pending_command = Some(PendingCommand {
            command: ControlCommand::Start,
            issued_at: now,
        });
        self.touch();
        Ok(())
    }

    /// Apply device progress. Percentage and layer never move backwards while printing.
    pub fn update_progress(&mut self, progress: &Progress) -> Result<()> {
        if progress.percentage > 100 {
            return Err(TaskError::ProgressOutOfRange(progress.percentage as u32));
        }
        if !matches!(self.status, TaskStatus::Printing | TaskStatus::Paused) {
            return Err(self.invalid("update progress"));
        }
        self.progress = self.progress.max(progress.percentage);
        self.current_layer = self.current_layer.max(progress.current_layer);
        if progress.total_layers > 0 {
            self.total_layers = progress.total_layers;
        }
        self.touch();
        Ok(())
    }

    /// Record that a command was sent and is awaiting confirmation.
    pub fn await_confirmation(&mut self, command: ControlCommand) {
        self.pending_command = Some(PendingCommand {
            command,
            issued_at: Utc::now(),
        });
        self.touch();
    }

    /// Pause (confirmed by the device).
    pub fn pause(&mut self) -> Result<()> {
        if self.status != TaskStatus::Printing {
            return Err(self.invalid("pause"));
        }
        self.status = TaskStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Resume (confirmed by the device).
    pub fn resume(&mut self) -> Result<()> {
        if self.status != TaskStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = TaskStatus::Printing;
        self.touch();
        Ok(())
    }

    /// Mark finished successfully.
    pub fn complete(&mut self) -> Result<()> {
        if !matches!(self.status, TaskStatus::Printing | TaskStatus::Paused) {
            return Err(self.invalid("complete"));
        }
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.pending_command = None;
        self.ended_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Record an error without changing status (used before a retry).
    pub fn record_error(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.last_error = Some(TaskFailure {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    /// Mark failed.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.record_error(kind, message);
        self.status = TaskStatus::Failed;
        self.queue_position = None;
        self.queue_key = None;
        self.pending_command = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Mark cancelled.
    pub fn cancel(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = TaskStatus::Cancelled;
        self.queue_position = None;
        self.queue_key = None;
        self.pending_command = None;
        self.ended_at = Some(Utc::now());
        self.touch();
        Ok(())
    }
}
