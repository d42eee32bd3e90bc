//! Scheduler loop.
//!
//! Each tick does three things, in order:
//! 1. connect enabled printers whose adapter is down, ask connected ones
//!    with an aging snapshot for a fresh report, and copy the latest
//!    snapshot into the printer record,
//! 2. fold snapshots into running tasks (progress, completion, faults,
//!    command confirmation),
//! 3. give every available printer at most one queued task.
//!
//! Per-task failures are logged and never stop the loop. The scheduler is the
//! only writer of `current_task_id`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use printloom_core::{
    CanonicalStatus, ConnectionState, ControlCommand, FailureKind, PrintTask, Printer,
    PrinterAdapter, PrinterSnapshot, TaskError, TaskId, TaskStatus,
};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, StoreError};
use crate::queue::PrintQueue;
use crate::registry::AdapterRegistry;
use crate::store::Store;

/// Counters for one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Printers connected this tick.
    pub connected: usize,
    /// Tasks that reached a terminal state while printing.
    pub finished: usize,
    /// Tasks handed to a printer.
    pub dispatched: usize,
    /// Tasks put back in the queue.
    pub requeued: usize,
    /// Tasks failed during hand-off.
    pub failed: usize,
}

/// What [`Scheduler::recover`] did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recovery {
    /// Interrupted hand-offs returned to the queue.
    pub requeued: Vec<TaskId>,
    /// Tasks whose slicing or packaging must run again.
    pub to_prepare: Vec<TaskId>,
    /// Finished tasks deleted.
    pub purged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Unchanged,
    Updated,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Started,
    Requeued,
    Failed,
    /// Cancelled by a user while being handed off.
    Abandoned,
}

struct HandOffFailure {
    kind: FailureKind,
    message: String,
}

impl HandOffFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

fn failure_reason(adapter: &dyn PrinterAdapter, fallback: &str) -> String {
    adapter.last_error().unwrap_or_else(|| fallback.to_string())
}

/// No report yet, or the last one is older than `max_age`.
fn is_stale(received_at: Option<DateTime<Utc>>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    received_at.map_or(true, |at| now - at >= max_age)
}

/// Fold one snapshot into a printing or paused task.
fn reconcile(
    task: &mut PrintTask,
    snapshot: &PrinterSnapshot,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Result<Reconciled, TaskError> {
    let command_timeout = chrono_duration(config.command_timeout);
    let pending = task.pending_command;

    // A user stop is in flight; the cancelling call settles the task.
    if let Some(cancel) = pending.filter(|p| p.command == ControlCommand::Cancel) {
        if now - cancel.issued_at > chrono_duration(config.cancel_timeout) * 2 {
            task.fail(FailureKind::CancelUnconfirmed, "stop was never confirmed")?;
            return Ok(Reconciled::Finished);
        }
        return Ok(Reconciled::Unchanged);
    }

    let running = matches!(snapshot.status, CanonicalStatus::Busy | CanonicalStatus::Paused);
    if !task.running_observed && !running {
        // Idle or a leftover fault belongs to the previous job until ours shows up.
        let issued = pending.map(|p| p.issued_at).or(task.started_at).unwrap_or(now);
        if now - issued > command_timeout {
            task.fail(
                FailureKind::CommandUnconfirmed,
                format!("printer never started the job (status {})", snapshot.status),
            )?;
            return Ok(Reconciled::Finished);
        }
        return Ok(Reconciled::Unchanged);
    }

    let mut changed = false;
    if !task.running_observed {
        task.running_observed = true;
        changed = true;
    }
    if pending.is_some_and(|p| p.command == ControlCommand::Start) {
        task.pending_command = None;
        changed = true;
    }

    match snapshot.status {
        CanonicalStatus::Busy => {
            if task.status == TaskStatus::Paused {
                task.resume()?;
                task.pending_command = None;
            } else if pending.is_some_and(|p| p.command == ControlCommand::Resume) {
                task.pending_command = None;
            }
            changed = true;
        }
        CanonicalStatus::Paused => {
            if task.status == TaskStatus::Printing {
                task.pause()?;
                task.pending_command = None;
            }
            changed = true;
        }
        CanonicalStatus::Idle if snapshot.finished => {
            task.complete()?;
            return Ok(Reconciled::Finished);
        }
        CanonicalStatus::Idle => {
            task.fail(FailureKind::Device, "job stopped on the printer")?;
            return Ok(Reconciled::Finished);
        }
        CanonicalStatus::Error => {
            let message = match snapshot.error_code {
                Some(code) => format!("printer reported fault {code:08X}"),
                None => "printer reported a fault".to_string(),
            };
            task.fail(FailureKind::Device, message)?;
            return Ok(Reconciled::Finished);
        }
        CanonicalStatus::Offline => {}
    }

    if running {
        if let Err(e) = task.update_progress(&snapshot.progress) {
            tracing::debug!(task_id = %task.id, error = %e, "Ignoring progress report");
        }
    }

    if let Some(p) = task
        .pending_command
        .filter(|p| matches!(p.command, ControlCommand::Pause | ControlCommand::Resume))
    {
        if now - p.issued_at > command_timeout {
            task.pending_command = None;
            task.record_error(
                FailureKind::CommandUnconfirmed,
                format!("{:?} was not confirmed", p.command),
            );
            changed = true;
        }
    }

    Ok(if changed {
        Reconciled::Updated
    } else {
        Reconciled::Unchanged
    })
}

/// Assigns queued tasks to printers and tracks them to completion.
pub struct Scheduler {
    store: Store,
    queue: PrintQueue,
    adapters: Arc<AdapterRegistry>,
    config: SchedulerConfig,
    tick_lock: Mutex<()>,
}

impl Scheduler {
    /// Scheduler over `store` using adapters from `adapters`.
    pub fn new(store: Store, adapters: Arc<AdapterRegistry>, config: SchedulerConfig) -> Self {
        Self {
            queue: PrintQueue::new(store.clone()),
            store,
            adapters,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    /// Scheduler policy.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Adapter registry.
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Repair state left by an unclean shutdown.
    ///
    /// Interrupted hand-offs go back to the queue under their original key,
    /// tasks still being prepared are reported for another preparation run,
    /// and finished tasks past the retention window are purged.
    pub fn recover(&self) -> Result<Recovery, SchedulerError> {
        let mut recovery = Recovery::default();

        for task in self.store.tasks_with_status(&[TaskStatus::Dispatching])? {
            self.store.release(task.id, &task.printer_id)?;
            self.queue.requeue(task.id)?;
            recovery.requeued.push(task.id);
        }

        recovery.to_prepare = self
            .store
            .tasks_with_status(&[TaskStatus::Pending, TaskStatus::Slicing])?
            .into_iter()
            .map(|task| task.id)
            .collect();

        let cutoff = Utc::now() - chrono_duration(self.config.retention);
        recovery.purged = self.store.purge_terminal(cutoff)?;

        tracing::info!(
            requeued = recovery.requeued.len(),
            to_prepare = recovery.to_prepare.len(),
            purged = recovery.purged,
            "Recovery complete"
        );
        Ok(recovery)
    }

    /// Tick until `shutdown` fires, then disconnect all adapters.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "Scheduler started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => tracing::debug!(?report, "Tick complete"),
                        Err(e) => tracing::error!(error = %e, "Tick failed"),
                    }
                }
            }
        }

        self.adapters.disconnect_all().await;
        tracing::info!("Scheduler stopped");
    }

    /// Run one tick.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        self.refresh_printers(&mut report).await?;
        self.reconcile_running(&mut report)?;
        self.dispatch(&mut report).await?;

        Ok(report)
    }

    async fn refresh_printers(&self, report: &mut TickReport) -> Result<(), SchedulerError> {
        // Idle printers report rarely on their own; ask well before the heartbeat lapses.
        let refresh_after = chrono_duration(self.config.heartbeat_ttl / 2);
        for printer in self.store.list_printers()? {
            if !printer.enabled {
                continue;
            }
            let Some(adapter) = self.adapters.get_or_create(&printer) else {
                continue;
            };

            let mut attempt = None;
            if adapter.connection_state() == ConnectionState::Disconnected {
                let ok = adapter.connect(&printer.connection).await;
                if ok {
                    report.connected += 1;
                } else {
                    tracing::warn!(
                        printer_id = %printer.id,
                        failures = printer.connect_failures + 1,
                        error = %failure_reason(adapter.as_ref(), "connect failed"),
                        "Printer connection failed"
                    );
                }
                attempt = Some(ok);
            } else if adapter.connection_state() == ConnectionState::Connected
                && is_stale(adapter.snapshot().received_at, Utc::now(), refresh_after)
                && !adapter.refresh().await
            {
                tracing::debug!(
                    printer_id = %printer.id,
                    error = %failure_reason(adapter.as_ref(), "refresh failed"),
                    "Status refresh not sent"
                );
            }

            let state = adapter.connection_state();
            let snapshot = adapter.snapshot();
            self.store.update_printer(&printer.id, |p| {
                match attempt {
                    Some(true) => p.connect_failures = 0,
                    Some(false) => p.connect_failures += 1,
                    None => {}
                }
                match (state, snapshot.received_at) {
                    (ConnectionState::Connected, Some(at)) => p.observe(snapshot.status, at),
                    (ConnectionState::Connected, None) => {}
                    _ => p.status = CanonicalStatus::Offline,
                }
            })?;
        }
        Ok(())
    }

    fn reconcile_running(&self, report: &mut TickReport) -> Result<(), SchedulerError> {
        let running = self
            .store
            .tasks_with_status(&[TaskStatus::Printing, TaskStatus::Paused])?;
        let now = Utc::now();

        for task in running {
            let Some(adapter) = self.adapters.get(&task.printer_id) else {
                continue;
            };
            let snapshot = adapter.snapshot();

            match self
                .store
                .update_task(task.id, |t| reconcile(t, &snapshot, now, &self.config))
            {
                Ok((task, Reconciled::Finished)) => {
                    report.finished += 1;
                    match &task.last_error {
                        Some(failure) if task.status == TaskStatus::Failed => tracing::warn!(
                            task_id = %task.id,
                            printer_id = %task.printer_id,
                            reason = %failure,
                            "Print failed"
                        ),
                        _ => tracing::info!(
                            task_id = %task.id,
                            printer_id = %task.printer_id,
                            status = %task.status,
                            "Print finished"
                        ),
                    }
                }
                Ok((task, Reconciled::Updated)) => tracing::debug!(
                    task_id = %task.id,
                    progress = task.progress,
                    layer = task.current_layer,
                    "Task progress"
                ),
                Ok((_, Reconciled::Unchanged)) => {}
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Failed to apply printer status"),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, report: &mut TickReport) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let ttl = chrono_duration(self.config.heartbeat_ttl);

        for printer in self.store.list_printers()? {
            if !printer.is_available(now, ttl) {
                continue;
            }
            let Some(task) = self.queue.dequeue_for(&printer.id)? else {
                continue;
            };

            match self.hand_off(&task, &printer.id).await {
                Ok(Dispatch::Started) => report.dispatched += 1,
                Ok(Dispatch::Requeued) => report.requeued += 1,
                Ok(Dispatch::Failed) => report.failed += 1,
                Ok(Dispatch::Abandoned) => {}
                Err(e) => {
                    tracing::error!(task_id = %task.id, printer_id = %printer.id, error = %e, "Dispatch failed")
                }
            }
        }
        Ok(())
    }

    /// Hand a dequeued task to its printer.
    async fn hand_off(&self, task: &PrintTask, printer_id: &str) -> Result<Dispatch, SchedulerError> {
        // The dequeue and the printer are not locked together: check again.
        let printer = self.store.get_printer(printer_id)?;
        let adapter = self.adapters.get(printer_id);
        let ttl = chrono_duration(self.config.heartbeat_ttl);
        let ready = match (&printer, &adapter) {
            (Some(p), Some(a)) => {
                p.is_available(Utc::now(), ttl)
                    && a.connection_state() == ConnectionState::Connected
                    && matches!(a.status(), CanonicalStatus::Idle | CanonicalStatus::Error)
            }
            _ => false,
        };
        let (Some(printer), Some(adapter), true) = (printer, adapter, ready) else {
            tracing::info!(task_id = %task.id, printer_id, "Printer no longer available");
            self.queue.requeue(task.id)?;
            return Ok(Dispatch::Requeued);
        };

        match self.store.assign(task.id, printer_id) {
            Ok(_) => {}
            Err(e @ StoreError::DuplicateAssignment { .. }) => {
                tracing::error!(task_id = %task.id, printer_id, error = %e, "Refusing double assignment");
                self.queue.requeue(task.id)?;
                return Ok(Dispatch::Requeued);
            }
            Err(e) => {
                self.queue.requeue(task.id)?;
                return Err(e.into());
            }
        }

        // Only hand-offs that claimed the printer use up the retry budget.
        match self.store.update_task(task.id, |t| t.record_attempt()) {
            Ok(_) => {}
            Err(StoreError::Task(_)) => {
                tracing::info!(task_id = %task.id, printer_id, "Task cancelled before upload");
                self.store.release(task.id, printer_id)?;
                return Ok(Dispatch::Abandoned);
            }
            Err(e) => {
                self.store.release(task.id, printer_id)?;
                return Err(e.into());
            }
        }

        if let Err(failure) = self.upload_and_start(task, &printer, adapter.as_ref()).await {
            return self.handle_dispatch_failure(task, printer_id, failure);
        }

        match self.store.update_task(task.id, |t| t.start_printing()) {
            Ok((started, _)) => {
                tracing::info!(
                    task_id = %started.id,
                    printer_id,
                    attempt = started.attempts,
                    "Print started"
                );
                Ok(Dispatch::Started)
            }
            Err(StoreError::Task(_)) => {
                tracing::info!(task_id = %task.id, printer_id, "Task cancelled during hand-off, stopping job");
                adapter.cancel_print().await;
                self.store.release(task.id, printer_id)?;
                Ok(Dispatch::Abandoned)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_and_start(
        &self,
        task: &PrintTask,
        printer: &Printer,
        adapter: &dyn PrinterAdapter,
    ) -> Result<(), HandOffFailure> {
        if adapter.connection_state() != ConnectionState::Connected
            && !adapter.connect(&printer.connection).await
        {
            return Err(HandOffFailure::new(
                FailureKind::Connection,
                failure_reason(adapter, "connect failed"),
            ));
        }

        let Some(container) = task.container_path.as_deref() else {
            return Err(HandOffFailure::new(FailureKind::Internal, "task has no container"));
        };
        let Some(file_name) = container.file_name().and_then(|n| n.to_str()) else {
            return Err(HandOffFailure::new(
                FailureKind::Internal,
                format!("bad container path {}", container.display()),
            ));
        };

        if !adapter.send_file(container).await {
            return Err(HandOffFailure::new(
                FailureKind::Transfer,
                failure_reason(adapter, "upload failed"),
            ));
        }
        if !adapter.start_print(file_name).await {
            return Err(HandOffFailure::new(
                FailureKind::Connection,
                failure_reason(adapter, "start command not accepted"),
            ));
        }
        Ok(())
    }

    /// Retry once (by default), then fail. The printer is freed either way.
    fn handle_dispatch_failure(
        &self,
        task: &PrintTask,
        printer_id: &str,
        failure: HandOffFailure,
    ) -> Result<Dispatch, SchedulerError> {
        self.store.release(task.id, printer_id)?;
        let HandOffFailure { kind, message } = failure;

        let max_attempts = self.config.max_dispatch_attempts;
        let outcome = self
            .store
            .update_task(task.id, |t| {
                if t.attempts < max_attempts {
                    t.record_error(kind, message.clone());
                    Ok(true)
                } else {
                    t.fail(kind, message.clone())?;
                    Ok(false)
                }
            })
            .and_then(|(updated, retry)| {
                if retry {
                    tracing::warn!(
                        task_id = %task.id,
                        printer_id,
                        attempt = updated.attempts,
                        kind = %kind,
                        reason = %message,
                        "Dispatch failed, will retry"
                    );
                    self.queue.requeue(task.id).map(|_| Dispatch::Requeued)
                } else {
                    tracing::error!(
                        task_id = %task.id,
                        printer_id,
                        attempt = updated.attempts,
                        kind = %kind,
                        reason = %message,
                        "Dispatch failed, giving up"
                    );
                    Ok(Dispatch::Failed)
                }
            });

        match outcome {
            Ok(dispatch) => Ok(dispatch),
            // Cancelled meanwhile.
            Err(StoreError::Task(_)) => Ok(Dispatch::Abandoned),
            Err(e) => Err(e.into()),
        }
    }

    fn require_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        Ok(self.store.get_task(id)?.ok_or(StoreError::TaskNotFound(id))?)
    }

    fn adapter_for(&self, task: &PrintTask) -> Result<Arc<dyn PrinterAdapter>, SchedulerError> {
        self.adapters
            .get(&task.printer_id)
            .ok_or_else(|| SchedulerError::NoAdapter(task.printer_id.clone()))
    }

    /// Cancel a task wherever it is.
    ///
    /// Queued and not-yet-queued tasks are cancelled in the store. A task on a
    /// printer is stopped through the adapter and ends `CANCELLED` once the
    /// status channel shows the printer idle or faulted, or
    /// `FAILED(CancelUnconfirmed)` after `cancel_timeout`.
    pub async fn cancel_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        let task = self.require_task(id)?;
        if task.status == TaskStatus::Queued && self.queue.remove(id)? {
            tracing::info!(task_id = %id, "Queued task cancelled");
            return self.require_task(id);
        }

        let (task, cancelled) = self.store.update_task(id, |t| {
            if matches!(t.status, TaskStatus::Printing | TaskStatus::Paused) {
                return Ok(false);
            }
            t.cancel()?;
            Ok(true)
        })?;
        if cancelled {
            tracing::info!(task_id = %id, "Task cancelled");
            return Ok(task);
        }

        self.cancel_on_printer(task).await
    }

    async fn cancel_on_printer(&self, task: PrintTask) -> Result<PrintTask, SchedulerError> {
        let adapter = self.adapter_for(&task)?;
        let mut updates = adapter.subscribe();
        // Only reports newer than the command count as an answer to it.
        let sent = updates.borrow().sequence;

        self.store.update_task(task.id, |t| {
            t.await_confirmation(ControlCommand::Cancel);
            Ok(())
        })?;

        let accepted = adapter.cancel_print().await;
        let confirmed = accepted
            && tokio::time::timeout(
                self.config.cancel_timeout,
                updates.wait_for(|s| {
                    s.sequence > sent && matches!(s.status, CanonicalStatus::Idle | CanonicalStatus::Error)
                }),
            )
            .await
            .is_ok_and(|seen| seen.is_ok());

        let (task, _) = if confirmed {
            tracing::info!(task_id = %task.id, printer_id = %task.printer_id, "Print cancelled");
            self.store.update_task(task.id, |t| t.cancel())?
        } else {
            let reason = if accepted {
                format!(
                    "no stop confirmation within {}s",
                    self.config.cancel_timeout.as_secs()
                )
            } else {
                failure_reason(adapter.as_ref(), "stop command not accepted")
            };
            tracing::warn!(task_id = %task.id, printer_id = %task.printer_id, reason = %reason, "Cancel unconfirmed");
            self.store
                .update_task(task.id, |t| t.fail(FailureKind::CancelUnconfirmed, reason))?
        };
        Ok(task)
    }

    /// Pause a printing task and wait for the printer to show it.
    pub async fn pause_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        let (task, adapter) = self.controllable(id, TaskStatus::Printing, "pause")?;
        let updates = adapter.subscribe();
        let sent = updates.borrow().sequence;
        self.store.update_task(id, |t| {
            t.await_confirmation(ControlCommand::Pause);
            Ok(())
        })?;

        if !adapter.pause_print().await {
            return Err(self.rejected(&task, adapter.as_ref(), "pause"));
        }
        self.confirm(&task, updates, sent, "pause", CanonicalStatus::Paused, TaskStatus::Printing, |t| {
            t.pause()
        })
        .await
    }

    /// Resume a paused task and wait for the printer to show it.
    pub async fn resume_task(&self, id: TaskId) -> Result<PrintTask, SchedulerError> {
        let (task, adapter) = self.controllable(id, TaskStatus::Paused, "resume")?;
        let updates = adapter.subscribe();
        let sent = updates.borrow().sequence;
        self.store.update_task(id, |t| {
            t.await_confirmation(ControlCommand::Resume);
            Ok(())
        })?;

        if !adapter.resume_print().await {
            return Err(self.rejected(&task, adapter.as_ref(), "resume"));
        }
        self.confirm(&task, updates, sent, "resume", CanonicalStatus::Busy, TaskStatus::Paused, |t| {
            t.resume()
        })
        .await
    }

    fn controllable(
        &self,
        id: TaskId,
        required: TaskStatus,
        action: &'static str,
    ) -> Result<(PrintTask, Arc<dyn PrinterAdapter>), SchedulerError> {
        let task = self.require_task(id)?;
        if task.status != required {
            return Err(TaskError::InvalidTransition {
                action,
                from: task.status,
            }
            .into());
        }
        let adapter = self.adapter_for(&task)?;
        Ok((task, adapter))
    }

    fn rejected(&self, task: &PrintTask, adapter: &dyn PrinterAdapter, command: &'static str) -> SchedulerError {
        if let Err(e) = self.store.update_task(task.id, |t| {
            t.pending_command = None;
            Ok(())
        }) {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to clear pending command");
        }
        SchedulerError::CommandRejected {
            printer_id: task.printer_id.clone(),
            command,
            reason: failure_reason(adapter, "not accepted"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn confirm(
        &self,
        task: &PrintTask,
        mut updates: watch::Receiver<PrinterSnapshot>,
        sent: u64,
        command: &'static str,
        expected: CanonicalStatus,
        from: TaskStatus,
        apply: impl FnOnce(&mut PrintTask) -> Result<(), TaskError>,
    ) -> Result<PrintTask, SchedulerError> {
        let seen = tokio::time::timeout(
            self.config.command_timeout,
            updates.wait_for(|s| s.sequence > sent && s.status == expected),
        )
        .await
        .is_ok_and(|seen| seen.is_ok());

        if seen {
            let (task, _) = self.store.update_task(task.id, |t| {
                if t.status == from {
                    apply(t)?;
                }
                t.pending_command = None;
                Ok(())
            })?;
            tracing::info!(task_id = %task.id, printer_id = %task.printer_id, command, "Command confirmed");
            return Ok(task);
        }

        self.store.update_task(task.id, |t| {
            t.pending_command = None;
            t.record_error(FailureKind::CommandUnconfirmed, format!("{command} was not confirmed"));
            Ok(())
        })?;
        Err(SchedulerError::Unconfirmed {
            printer_id: task.printer_id.clone(),
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{printer, queued_task, FakeAdapter, FakeFactory};

    fn setup(config: SchedulerConfig) -> (Store, Arc<FakeAdapter>, Scheduler) {
        let store = Store::open_in_memory().unwrap();
        store.register_printer(&printer("p1")).unwrap();
        let adapter = Arc::new(FakeAdapter::new());
        let factory = FakeFactory::default().with("p1", adapter.clone());
        let registry = Arc::new(AdapterRegistry::new(Arc::new(factory)));
        let scheduler = Scheduler::new(store.clone(), registry, config);
        (store, adapter, scheduler)
    }

    fn task(store: &Store, id: TaskId) -> PrintTask {
        store.get_task(id).unwrap().unwrap()
    }

    fn current_task(store: &Store) -> Option<TaskId> {
        store.get_printer("p1").unwrap().unwrap().current_task_id
    }

    #[tokio::test]
    async fn test_tick_dispatches_to_idle_printer() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.connected, 1);
        assert_eq!(report.dispatched, 1);
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Printing);
        assert_eq!(t.queue_position, None);
        assert_eq!(t.attempts, 1);
        assert_eq!(current_task(&store), Some(id));
        assert_eq!(*adapter.started.lock().unwrap(), vec![format!("{id}.gcode.3mf")]);
    }

    #[tokio::test]
    async fn test_progress_then_completion() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();

        adapter.report(CanonicalStatus::Busy, false, 40);
        scheduler.tick().await.unwrap();
        let t = task(&store, id);
        assert_eq!(t.progress, 40);
        assert!(t.running_observed);
        assert_eq!(t.pending_command, None);

        // A late, lower report does not move progress back.
        adapter.report(CanonicalStatus::Busy, false, 35);
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, id).progress, 40);

        adapter.report(CanonicalStatus::Idle, true, 100);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.finished, 1);
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100);
        assert_eq!(current_task(&store), None);
    }

    #[tokio::test]
    async fn test_fault_fails_task_and_frees_printer_in_one_tick() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let first = queued_task(&store, "p1", 5);
        let second = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 10);
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, second).status, TaskStatus::Queued);

        adapter.report(CanonicalStatus::Error, false, 10);
        let report = scheduler.tick().await.unwrap();

        let failed = task(&store, first);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.unwrap().kind, FailureKind::Device);
        assert_eq!(report.dispatched, 1);
        assert_eq!(task(&store, second).status, TaskStatus::Printing);
        assert_eq!(current_task(&store), Some(second));

        // The leftover fault does not fail the new job before it starts.
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, second).status, TaskStatus::Printing);
    }

    #[tokio::test]
    async fn test_stop_on_device_fails_task() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 50);
        scheduler.tick().await.unwrap();

        adapter.report(CanonicalStatus::Idle, false, 0);
        scheduler.tick().await.unwrap();

        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::Device);
    }

    #[tokio::test]
    async fn test_unstarted_job_times_out() {
        let config = SchedulerConfig {
            command_timeout: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        let (store, _adapter, scheduler) = setup(config);
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();

        scheduler.tick().await.unwrap();

        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::CommandUnconfirmed);
        assert_eq!(current_task(&store), None);
    }

    #[tokio::test]
    async fn test_transfer_failure_retries_once() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.send_ok.store(false, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.requeued, 1);
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::Transfer);
        assert_eq!(current_task(&store), None);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.attempts, 2);
        assert_eq!(adapter.uploads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_busy_printer_gets_task_back_in_queue() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let first = queued_task(&store, "p1", 0);
        let second = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, first).status, TaskStatus::Printing);

        // Force a hand-off while the device reports a job running.
        store.update_task(first, |t| t.complete()).unwrap();
        adapter.report(CanonicalStatus::Busy, false, 0);
        let dequeued = scheduler.queue.dequeue_for("p1").unwrap().unwrap();
        assert_eq!(dequeued.id, second);

        let outcome = scheduler.hand_off(&dequeued, "p1").await.unwrap();

        assert_eq!(outcome, Dispatch::Requeued);
        let t = task(&store, second);
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.queue_position, Some(1));
    }

    #[tokio::test]
    async fn test_offline_printer_is_not_dispatched() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.connect_ok.store(false, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);

        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();

        assert_eq!(task(&store, id).status, TaskStatus::Queued);
        let p = store.get_printer("p1").unwrap().unwrap();
        assert_eq!(p.status, CanonicalStatus::Offline);
        assert_eq!(p.connect_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_cancel_fails_task() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 20);
        scheduler.tick().await.unwrap();

        let t = scheduler.cancel_task(id).await.unwrap();

        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::CancelUnconfirmed);
        assert_eq!(adapter.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(current_task(&store), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_cancel() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.obey.store(true, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 20);
        scheduler.tick().await.unwrap();

        let t = scheduler.cancel_task(id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);

        // The stop leaves the device faulted; the printer is still usable.
        let next = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, next).status, TaskStatus::Printing);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_skips_printer() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.connect_ok.store(false, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);

        let t = scheduler.cancel_task(id).await.unwrap();

        assert_eq!(t.status, TaskStatus::Cancelled);
        assert_eq!(adapter.cancels.load(Ordering::SeqCst), 0);
        assert!(scheduler.queue.is_empty().unwrap());
        assert!(scheduler.cancel_task(id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.obey.store(true, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 30);
        scheduler.tick().await.unwrap();

        let t = scheduler.pause_task(id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Paused);
        assert_eq!(t.pending_command, None);
        assert!(scheduler.pause_task(id).await.is_err());

        let t = scheduler.resume_task(id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Printing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_pause_keeps_printing() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 30);
        scheduler.tick().await.unwrap();

        let err = scheduler.pause_task(id).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Unconfirmed { .. }));
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Printing);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::CommandUnconfirmed);
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_hand_off() {
        let (store, _adapter, scheduler) = setup(SchedulerConfig::default());
        let interrupted = queued_task(&store, "p1", 0);
        let waiting = queued_task(&store, "p1", 0);
        let dequeued = scheduler.queue.dequeue().unwrap().unwrap();
        assert_eq!(dequeued.id, interrupted);
        store.assign(interrupted, "p1").unwrap();

        let pending = PrintTask::new("cube.stl", "p1", printloom_core::SlicingConfig::fast(), 0);
        store.insert_task(&pending).unwrap();

        let recovery = scheduler.recover().unwrap();

        assert_eq!(recovery.requeued, vec![interrupted]);
        assert_eq!(recovery.to_prepare, vec![pending.id]);
        assert_eq!(task(&store, interrupted).queue_position, Some(1));
        assert_eq!(task(&store, waiting).queue_position, Some(2));
        assert_eq!(current_task(&store), None);
    }

    #[test]
    fn test_reconcile_ignores_offline() {
        let config = SchedulerConfig::default();
        let mut t = PrintTask::new("cube.stl", "p1", printloom_core::SlicingConfig::fast(), 0);
        t.status = TaskStatus::Printing;
        t.running_observed = true;
        let snapshot = PrinterSnapshot::offline();

        let outcome = reconcile(&mut t, &snapshot, Utc::now(), &config).unwrap();

        assert_eq!(outcome, Reconciled::Unchanged);
        assert_eq!(t.status, TaskStatus::Printing);
    }

    #[tokio::test]
    async fn test_availability_requeue_keeps_retry_budget() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        scheduler.tick().await.unwrap();
        let id = queued_task(&store, "p1", 0);

        // The printer picks up a job between the dequeue and the hand-off.
        adapter.report(CanonicalStatus::Busy, false, 0);
        let dequeued = scheduler.queue.dequeue_for("p1").unwrap().unwrap();
        assert_eq!(scheduler.hand_off(&dequeued, "p1").await.unwrap(), Dispatch::Requeued);
        assert_eq!(task(&store, id).attempts, 0);

        adapter.report(CanonicalStatus::Idle, false, 0);
        adapter.send_ok.store(false, Ordering::SeqCst);
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.requeued, 1);
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::Transfer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_needs_a_report_after_the_stop() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        // Still showing the idle report from before the start.
        assert_eq!(adapter.status(), CanonicalStatus::Idle);

        let t = scheduler.cancel_task(id).await.unwrap();

        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.unwrap().kind, FailureKind::CancelUnconfirmed);
        assert_eq!(adapter.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_ignores_report_sent_before_command() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        adapter.obey.store(true, Ordering::SeqCst);
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 30);
        scheduler.tick().await.unwrap();
        scheduler.pause_task(id).await.unwrap();

        adapter.obey.store(false, Ordering::SeqCst);
        adapter.report(CanonicalStatus::Busy, false, 30);
        let err = scheduler.resume_task(id).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Unconfirmed { .. }));
        assert_eq!(task(&store, id).status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_aging_snapshot_triggers_refresh() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(adapter.refreshes.load(Ordering::SeqCst), 0);

        adapter.age(chrono::Duration::seconds(61));
        scheduler.tick().await.unwrap();
        assert_eq!(adapter.refreshes.load(Ordering::SeqCst), 1);
        let seen = store.get_printer("p1").unwrap().unwrap().last_heartbeat.unwrap();
        assert!(Utc::now() - seen < chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_quiet_idle_printer_still_gets_work() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        scheduler.tick().await.unwrap();
        // Past the heartbeat TTL: without a refresh the printer would look dead.
        adapter.age(chrono::Duration::seconds(300));
        let id = queued_task(&store, "p1", 0);

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(task(&store, id).status, TaskStatus::Printing);
    }

    #[tokio::test]
    async fn test_print_survives_dropped_channel() {
        let (store, adapter, scheduler) = setup(SchedulerConfig::default());
        let id = queued_task(&store, "p1", 0);
        scheduler.tick().await.unwrap();
        adapter.report(CanonicalStatus::Busy, false, 40);
        scheduler.tick().await.unwrap();

        adapter.drop_channel();
        adapter.connect_ok.store(false, Ordering::SeqCst);
        scheduler.tick().await.unwrap();

        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Printing);
        assert_eq!(t.progress, 40);
        assert_eq!(current_task(&store), Some(id));
        assert_eq!(store.get_printer("p1").unwrap().unwrap().status, CanonicalStatus::Offline);

        adapter.connect_ok.store(true, Ordering::SeqCst);
        adapter.report(CanonicalStatus::Busy, false, 70);
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, id).progress, 70);

        adapter.report(CanonicalStatus::Idle, true, 100);
        scheduler.tick().await.unwrap();
        assert_eq!(task(&store, id).status, TaskStatus::Completed);
        assert_eq!(current_task(&store), None);
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(60);
        assert!(is_stale(None, now, max_age));
        assert!(!is_stale(Some(now - chrono::Duration::seconds(10)), now, max_age));
        assert!(is_stale(Some(now - chrono::Duration::seconds(60)), now, max_age));
    }
}
