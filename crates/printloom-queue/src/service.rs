//! Print service: the operations exposed to API layers and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use printloom_bambu::{threemf, ContainerMetadata};
use printloom_core::{
    AdapterFactory, FailureKind, PrintTask, Printer, SlicingConfig, TaskId, TaskStatus,
};
use printloom_slicer::Slicer;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{SchedulerError, StoreError};
use crate::queue::{PrintQueue, QueueStatus};
use crate::registry::AdapterRegistry;
use crate::scheduler::Scheduler;
use crate::store::Store;

/// Slices and packages one task, then queues it.
#[derive(Clone)]
struct Preparation {
    store: Store,
    queue: PrintQueue,
    slicer: Arc<dyn Slicer>,
    jobs_dir: PathBuf,
}

impl Preparation {
    async fn run(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        let task = match self.store.update_task(id, |t| t.start_slicing()) {
            Ok((task, _)) => task,
            Err(e) => return self.lost_race(id, e),
        };
        tracing::info!(task_id = %id, model = %task.model_ref, "Preparing task");

        let Some(printer) = self.store.get_printer(&task.printer_id)? else {
            return self.fail(id, FailureKind::Internal, format!("printer {} is not registered", task.printer_id));
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.jobs_dir).await {
            return self.fail(id, FailureKind::Internal, format!("cannot create {}: {e}", self.jobs_dir.display()));
        }

        let output = self.jobs_dir.join(format!("{id}.gcode"));
        let sliced = self
            .slicer
            .slice(Path::new(&task.model_ref), &printer.profile, &task.slicing_config, &output)
            .await;
        let result = match sliced {
            Ok(result) => result,
            Err(e) => return self.fail(id, FailureKind::Slicing, e.to_string()),
        };
        if result.estimated {
            tracing::debug!(task_id = %id, "Toolpath statistics were estimated");
        }
        if let Err(e) = self.store.update_task(id, |t| t.record_slice(result.outcome())) {
            return self.lost_race(id, e);
        }

        let metadata = ContainerMetadata {
            printer_model: Some(printer.profile.name.clone()),
            settings: Some(task.slicing_config.clone()),
            estimated_secs: Some(result.estimated_duration.as_secs()),
            estimated_material_g: Some(result.estimated_material_g),
            thumbnail: None,
        };
        let toolpath = result.output_path.clone();
        let wrapped = tokio::task::spawn_blocking(move || threemf::wrap(&toolpath, &metadata)).await;
        let container = match wrapped {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => return self.fail(id, FailureKind::Conversion, e.to_string()),
            Err(e) => return self.fail(id, FailureKind::Internal, format!("packaging worker failed: {e}")),
        };
        if let Err(e) = self.store.update_task(id, |t| t.record_container(container)) {
            return self.lost_race(id, e);
        }

        match self.queue.enqueue(id, task.priority) {
            Ok(_) => Ok(TaskStatus::Queued),
            Err(e) => self.lost_race(id, e),
        }
    }

    fn fail(&self, id: TaskId, kind: FailureKind, message: String) -> Result<TaskStatus, SchedulerError> {
        tracing::warn!(task_id = %id, kind = %kind, reason = %message, "Task preparation failed");
        match self.store.update_task(id, |t| t.fail(kind, message)) {
            Ok((task, _)) => Ok(task.status),
            Err(e) => self.lost_race(id, e),
        }
    }

    /// A rejected transition after a concurrent cancel is not an error.
    fn lost_race(&self, id: TaskId, error: StoreError) -> Result<TaskStatus, SchedulerError> {
        if let StoreError::Task(_) = &error {
            if let Some(task) = self.store.get_task(id)?.filter(|t| t.is_terminal()) {
                tracing::debug!(task_id = %id, status = %task.status, "Preparation stopped");
                return Ok(task.status);
            }
        }
        Err(error.into())
    }
}

/// Entry point for creating, inspecting and controlling print tasks.
pub struct PrintService {
    store: Store,
    queue: PrintQueue,
    scheduler: Arc<Scheduler>,
    preparation: Preparation,
    workers: Mutex<JoinSet<()>>,
}

impl PrintService {
    /// Service over an open store.
    pub fn new(
        store: Store,
        scheduler: Arc<Scheduler>,
        slicer: Arc<dyn Slicer>,
        jobs_dir: impl Into<PathBuf>,
    ) -> Self {
        let queue = PrintQueue::new(store.clone());
        Self {
            preparation: Preparation {
                store: store.clone(),
                queue: queue.clone(),
                slicer,
                jobs_dir: jobs_dir.into(),
            },
            store,
            queue,
            scheduler,
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Open the database under `config.data_dir` and wire the configured
    /// slicer engine and `factory`'s adapters.
    pub fn from_config(
        config: &AppConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Store::open(config.database_path())?;
        let registry = Arc::new(AdapterRegistry::new(factory));
        let scheduler = Arc::new(Scheduler::new(store.clone(), registry, config.scheduler.clone()));
        let slicer = config.slicer.clone().into_slicer();
        Ok(Self::new(store, scheduler, slicer, config.jobs_dir()))
    }

    /// The scheduler driving this service.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Recover from the previous run and start the scheduler loop.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>, SchedulerError> {
        let recovery = self.scheduler.recover()?;
        for id in recovery.to_prepare {
            self.spawn_preparation(id).await;
        }

        let scheduler = self.scheduler.clone();
        Ok(tokio::spawn(async move { scheduler.run(shutdown).await }))
    }

    /// Wait for every running preparation to finish.
    pub async fn wait_for_workers(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        while workers.join_next().await.is_some() {}
    }

    async fn spawn_preparation(&self, id: TaskId) {
        let preparation = self.preparation.clone();
        let mut workers = self.workers.lock().await;
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            if let Err(e) = preparation.run(id).await {
                tracing::error!(task_id = %id, error = %e, "Task preparation aborted");
            }
        });
    }

    // ========== Printers ==========

    /// Register a printer or update its registration.
    ///
    /// A changed connection or profile drops the live adapter so the next
    /// tick reconnects with the new settings.
    pub async fn register_printer(&self, printer: Printer) -> Result<Printer, SchedulerError> {
        printer.validate()?;
        let previous = self.store.get_printer(&printer.id)?;
        let stored = self.store.register_printer(&printer)?;

        let relink = previous.is_some_and(|p| {
            p.connection != stored.connection || p.profile != stored.profile || !stored.enabled
        });
        if relink {
            self.scheduler.adapters().remove(&stored.id).await;
        }
        tracing::info!(printer_id = %stored.id, model = %stored.model, host = %stored.connection.host, "Printer registered");
        Ok(stored)
    }

    /// All printers.
    pub fn list_printers(&self) -> Result<Vec<Printer>, SchedulerError> {
        Ok(self.store.list_printers()?)
    }

    /// One printer.
    pub fn get_printer(&self, id: &str) -> Result<Option<Printer>, SchedulerError> {
        Ok(self.store.get_printer(id)?)
    }

    // ========== Tasks ==========

    /// Create a task and start preparing it in the background.
    pub async fn create_task(
        &self,
        model_ref: &str,
        printer_id: &str,
        config: SlicingConfig,
        priority: i32,
    ) -> Result<TaskId, SchedulerError> {
        config.validate()?;
        if self.store.get_printer(printer_id)?.is_none() {
            return Err(StoreError::PrinterNotFound(printer_id.to_string()).into());
        }
        if !Path::new(model_ref).is_file() {
            return Err(SchedulerError::ModelNotFound(PathBuf::from(model_ref)));
        }

        let task = PrintTask::new(model_ref, printer_id, config, priority);
        self.store.insert_task(&task)?;
        tracing::info!(task_id = %task.id, printer_id, priority, "Task created");

        self.spawn_preparation(task.id).await;
        Ok(task.id)
    }

    /// Slice, package and queue a task in the caller's task.
    pub async fn prepare_task(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        self.preparation.run(id).await
    }

    /// One task.
    pub fn get_task(&self, id: TaskId) -> Result<Option<PrintTask>, SchedulerError> {
        Ok(self.store.get_task(id)?)
    }

    /// Tasks, oldest first, optionally only those in `status`.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<PrintTask>, SchedulerError> {
        let tasks = match status {
            Some(status) => self.store.tasks_with_status(&[status])?,
            None => self.store.list_tasks()?,
        };
        Ok(tasks)
    }

    /// Cancel a task; see [`Scheduler::cancel_task`].
    pub async fn cancel_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        self.scheduler.cancel_task(id).await
    }

    /// Pause a printing task.
    pub async fn pause_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        self.scheduler.pause_task(id).await
    }

    /// Resume a paused task.
    pub async fn resume_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        self.scheduler.resume_task(id).await
    }

    /// Move a queued task to another priority. Returns its new position.
    pub fn reprioritize(&self, id: TaskId, priority: i32) -> Result<Option<u32>, SchedulerError> {
        Ok(self.queue.reprioritize(id, priority)?)
    }

    /// Head of the queue.
    pub fn queue_summary(&self, top_n: usize) -> Result<QueueStatus, SchedulerError> {
        Ok(self.queue.status(top_n)?)
    }
}
