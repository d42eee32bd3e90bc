//! Durable priority queue.
//!
//! Entries are ordered by `(-priority, sequence)`: higher priority first,
//! then arrival order. The sequence counter lives in the store, so the order
//! survives restarts.

use printloom_core::{PrintTask, TaskId, TaskStatus};
use serde::Serialize;

use crate::error::StoreResult;
use crate::store::Store;

/// Number of entries reported by [`PrintQueue::status`] by default.
pub const DEFAULT_STATUS_DEPTH: usize = 5;

/// One entry of a queue report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    /// 1-based position.
    pub position: u32,
    /// Task ID.
    pub task_id: TaskId,
    /// Target printer.
    pub printer_id: String,
    /// Priority.
    pub priority: i32,
    /// Estimated print time (s).
    pub estimated_duration_secs: u64,
    /// Sum of the estimated durations ahead of this entry (s).
    pub wait_secs: u64,
}

/// Snapshot of the head of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Number of queued tasks.
    pub total: u64,
    /// First entries, in dequeue order.
    pub top: Vec<QueueEntry>,
    /// Estimated time to drain the reported entries (s).
    pub estimated_wait_secs: u64,
}

/// Priority queue over the durable store.
#[derive(Clone)]
pub struct PrintQueue {
    store: Store,
}

impl PrintQueue {
    /// Queue backed by `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Add a prepared task. Returns its 1-based position.
    pub fn enqueue(&self, task_id: TaskId, priority: i32) -> StoreResult<u32> {
        let position = self.store.enqueue(task_id, priority)?;
        tracing::info!(task_id = %task_id, priority, position, "Task enqueued");
        Ok(position)
    }

    /// Remove and return the highest-ranked task. It comes back `DISPATCHING`.
    pub fn dequeue(&self) -> StoreResult<Option<PrintTask>> {
        self.store.dequeue(|_| true)
    }

    /// Remove and return the highest-ranked task targeting `printer_id`.
    pub fn dequeue_for(&self, printer_id: &str) -> StoreResult<Option<PrintTask>> {
        let task = self.store.dequeue(|task| task.printer_id == printer_id)?;
        if let Some(task) = &task {
            tracing::debug!(task_id = %task.id, printer_id, "Task dequeued");
        }
        Ok(task)
    }

    /// Put a dequeued task back at its original key.
    pub fn requeue(&self, task_id: TaskId) -> StoreResult<u32> {
        let position = self.store.requeue(task_id)?;
        tracing::info!(task_id = %task_id, position, "Task requeued");
        Ok(position)
    }

    /// Withdraw a queued task, cancelling it. Returns `false` if it was not queued.
    pub fn remove(&self, task_id: TaskId) -> StoreResult<bool> {
        let (_, removed) = self.store.update_task(task_id, |task| {
            if task.status != TaskStatus::Queued {
                return Ok(false);
            }
            task.cancel()?;
            Ok(true)
        })?;
        if removed {
            tracing::info!(task_id = %task_id, "Task removed from queue");
        }
        Ok(removed)
    }

    /// Move a queued task to a new priority band. Returns the new position.
    pub fn reprioritize(&self, task_id: TaskId, priority: i32) -> StoreResult<Option<u32>> {
        self.store.reprioritize(task_id, priority)
    }

    /// Current 1-based position, if queued.
    pub fn position(&self, task_id: TaskId) -> StoreResult<Option<u32>> {
        Ok(self
            .store
            .get_task(task_id)?
            .filter(|task| task.status == TaskStatus::Queued)
            .and_then(|task| task.queue_position))
    }

    /// Number of queued tasks.
    pub fn len(&self) -> StoreResult<u64> {
        self.store.queue_len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Report the first `top_n` entries with cumulative wait estimates.
    pub fn status(&self, top_n: usize) -> StoreResult<QueueStatus> {
        let total = self.store.queue_len()?;
        let head = self.store.queue_head(top_n)?;

        let mut wait_secs = 0;
        let mut top = Vec::with_capacity(head.len());
        for (index, task) in head.into_iter().enumerate() {
            let duration = task.estimated_duration_secs.unwrap_or(0);
            top.push(QueueEntry {
                position: index as u32 + 1,
                task_id: task.id,
                printer_id: task.printer_id,
                priority: task.priority,
                estimated_duration_secs: duration,
                wait_secs,
            });
            wait_secs += duration;
        }

        Ok(QueueStatus {
            total,
            top,
            estimated_wait_secs: wait_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printloom_core::{SliceOutcome, SlicingConfig};

    fn prepared(store: &Store, printer_id: &str, duration: u64) -> TaskId {
        let mut task = PrintTask::new("model.stl", printer_id, SlicingConfig::standard(), 0);
        task.start_slicing().unwrap();
        task.record_slice(SliceOutcome {
            toolpath_path: "model.gcode".into(),
            estimated_duration_secs: duration,
            estimated_material_g: 3.0,
            total_layers: 40,
        })
        .unwrap();
        task.record_container("model.gcode.3mf".into()).unwrap();
        store.insert_task(&task).unwrap();
        task.id
    }

    fn drain(queue: &PrintQueue) -> Vec<TaskId> {
        std::iter::from_fn(|| queue.dequeue().unwrap().map(|t| t.id)).collect()
    }

    #[test]
    fn test_higher_priority_dequeues_first() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let t1 = prepared(&store, "p1", 60);
        let t2 = prepared(&store, "p1", 60);

        assert_eq!(queue.enqueue(t1, 0).unwrap(), 1);
        assert_eq!(queue.enqueue(t2, 5).unwrap(), 1);
        assert_eq!(queue.position(t1).unwrap(), Some(2));

        assert_eq!(drain(&queue), vec![t2, t1]);
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let ids: Vec<TaskId> = (0..5).map(|_| prepared(&store, "p1", 60)).collect();
        let priorities = [1, 3, 1, 3, 2];
        for (id, priority) in ids.iter().zip(priorities) {
            queue.enqueue(*id, priority).unwrap();
        }

        assert_eq!(drain(&queue), vec![ids[1], ids[3], ids[4], ids[0], ids[2]]);
    }

    #[test]
    fn test_requeue_restores_original_place() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let first = prepared(&store, "p1", 60);
        let second = prepared(&store, "p1", 60);
        queue.enqueue(first, 0).unwrap();
        queue.enqueue(second, 0).unwrap();

        let taken = queue.dequeue().unwrap().unwrap();
        assert_eq!(taken.id, first);
        assert_eq!(queue.requeue(first).unwrap(), 1);
        assert_eq!(store.get_task(first).unwrap().unwrap().attempts, 0);

        assert_eq!(drain(&queue), vec![first, second]);
    }

    #[test]
    fn test_dequeue_for_skips_other_printers() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let for_a = prepared(&store, "a", 60);
        let for_b = prepared(&store, "b", 60);
        queue.enqueue(for_a, 9).unwrap();
        queue.enqueue(for_b, 0).unwrap();

        let taken = queue.dequeue_for("b").unwrap().unwrap();
        assert_eq!(taken.id, for_b);
        assert!(queue.dequeue_for("b").unwrap().is_none());
        assert_eq!(queue.position(for_a).unwrap(), Some(1));
    }

    #[test]
    fn test_remove_and_reprioritize() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let a = prepared(&store, "p1", 60);
        let b = prepared(&store, "p1", 60);
        let c = prepared(&store, "p1", 60);
        for id in [a, b, c] {
            queue.enqueue(id, 0).unwrap();
        }

        assert!(queue.remove(b).unwrap());
        assert!(!queue.remove(b).unwrap());
        assert_eq!(store.get_task(b).unwrap().unwrap().status, TaskStatus::Cancelled);

        assert_eq!(queue.reprioritize(c, 10).unwrap(), Some(1));
        assert_eq!(queue.reprioritize(b, 10).unwrap(), None);
        assert_eq!(drain(&queue), vec![c, a]);
    }

    #[test]
    fn test_status_reports_cumulative_wait() {
        let store = Store::open_in_memory().unwrap();
        let queue = PrintQueue::new(store.clone());
        let durations = [600, 1200, 300];
        for duration in durations {
            let id = prepared(&store, "p1", duration);
            queue.enqueue(id, 0).unwrap();
        }

        let status = queue.status(2).unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.top.len(), 2);
        assert_eq!(status.top[0].wait_secs, 0);
        assert_eq!(status.top[1].wait_secs, 600);
        assert_eq!(status.top[1].position, 2);
        assert_eq!(status.estimated_wait_secs, 1800);
    }

    #[test]
    fn test_order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.redb");

        let expected: Vec<TaskId> = {
            let store = Store::open(&path).unwrap();
            let queue = PrintQueue::new(store.clone());
            let ids: Vec<TaskId> = (0..4).map(|_| prepared(&store, "p1", 60)).collect();
            for (id, priority) in ids.iter().zip([0, 2, 0, 2]) {
                queue.enqueue(*id, priority).unwrap();
            }
            vec![ids[1], ids[3], ids[0], ids[2]]
        };

        let store = Store::open(&path).unwrap();
        let queue = PrintQueue::new(store.clone());
        assert_eq!(drain(&queue), expected);

        // The sequence counter kept counting across the reopen.
        let late = prepared(&store, "p1", 60);
        queue.enqueue(late, 2).unwrap();
        let late_key = store.get_task(late).unwrap().unwrap().queue_key.unwrap();
        assert!(late_key.sequence > 4);
    }
}
