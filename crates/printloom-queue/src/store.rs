//! redb-backed storage for tasks, printers and the queue index.
//!
//! Every write goes through one transaction that also keeps the derived
//! state consistent: the queue index follows the task's status and key, queue
//! positions are renumbered, and a task reaching a terminal state releases
//! its printer.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use printloom_core::{PrintTask, Printer, QueueKey, TaskError, TaskId, TaskStatus};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
    WriteTransaction,
};
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};

/// Tasks: key = task_id, value = JSON
const TASKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Printers: key = printer_id, value = JSON
const PRINTERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("printers");

/// Queue index: (-priority, sequence, task_id) -> ()
const QUEUE_TABLE: TableDefinition<(i64, u64, &str), ()> = TableDefinition::new("queue");

/// Counters
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQUENCE: &str = "next_sequence";

fn entry_key(key: &QueueKey) -> (i64, u64) {
    (-i64::from(key.priority), key.sequence)
}

/// Queue entry a task should have, given its current state.
fn queue_entry(task: &PrintTask) -> Option<(i64, u64, String)> {
    match (task.status, task.queue_key) {
        (TaskStatus::Queued, Some(key)) => {
            let (rank, sequence) = entry_key(&key);
            Some((rank, sequence, task.id.to_string()))
        }
        _ => None,
    }
}

fn decode<T, D>(table: &T, key: &str) -> StoreResult<Option<D>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    D: DeserializeOwned,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn decode_all<T, D>(table: &T) -> StoreResult<Vec<D>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    D: DeserializeOwned,
{
    let mut items = Vec::new();
    for entry in table.iter()? {
        let (_, guard) = entry?;
        items.push(serde_json::from_slice(guard.value())?);
    }
    Ok(items)
}

/// All tables, opened once per write transaction.
struct Tables<'txn> {
    tasks: Table<'txn, &'static str, &'static [u8]>,
    printers: Table<'txn, &'static str, &'static [u8]>,
    queue: Table<'txn, (i64, u64, &'static str), ()>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> Tables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> StoreResult<Self> {
        Ok(Self {
            tasks: txn.open_table(TASKS_TABLE)?,
            printers: txn.open_table(PRINTERS_TABLE)?,
            queue: txn.open_table(QUEUE_TABLE)?,
            meta: txn.open_table(META_TABLE)?,
        })
    }

    fn task(&self, id: TaskId) -> StoreResult<Option<PrintTask>> {
        decode(&self.tasks, &id.to_string())
    }

    fn require_task(&self, id: TaskId) -> StoreResult<PrintTask> {
        self.task(id)?.ok_or(StoreError::TaskNotFound(id))
    }

    fn put_task(&mut self, task: &PrintTask) -> StoreResult<()> {
        let value = serde_json::to_vec(task)?;
        self.tasks.insert(task.id.to_string().as_str(), value.as_slice())?;
        Ok(())
    }

    fn printer(&self, id: &str) -> StoreResult<Option<Printer>> {
        decode(&self.printers, id)
    }

    fn put_printer(&mut self, printer: &Printer) -> StoreResult<()> {
        let value = serde_json::to_vec(printer)?;
        self.printers.insert(printer.id.as_str(), value.as_slice())?;
        Ok(())
    }

    fn next_sequence(&mut self) -> StoreResult<u64> {
        let next = self.meta.get(NEXT_SEQUENCE)?.map(|v| v.value()).unwrap_or(1);
        self.meta.insert(NEXT_SEQUENCE, next + 1)?;
        Ok(next)
    }

    fn queued_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.queue.iter()? {
            let (key, _) = entry?;
            let (_, _, id) = key.value();
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    /// Rewrite cached positions. Returns task IDs in queue order.
    fn renumber(&mut self) -> StoreResult<Vec<String>> {
        let ids = self.queued_ids()?;
        for (index, id) in ids.iter().enumerate() {
            let position = index as u32 + 1;
            let Some(mut task) = decode::<_, PrintTask>(&self.tasks, id)? else {
                continue;
            };
            if task.queue_position != Some(position) {
                task.set_queue_position(position);
                self.put_task(&task)?;
            }
        }
        Ok(ids)
    }

    /// Move the queue index from `before` to whatever `task` now needs.
    fn sync_queue(
        &mut self,
        before: Option<(i64, u64, String)>,
        task: &PrintTask,
    ) -> StoreResult<bool> {
        let after = queue_entry(task);
        if before == after {
            return Ok(false);
        }
        if let Some((rank, sequence, id)) = &before {
            self.queue.remove((*rank, *sequence, id.as_str()))?;
        }
        if let Some((rank, sequence, id)) = &after {
            self.queue.insert((*rank, *sequence, id.as_str()), ())?;
        }
        Ok(true)
    }

    /// Detach a finished task from its printer.
    fn release_printer(&mut self, task: &PrintTask) -> StoreResult<()> {
        let Some(mut printer) = self.printer(&task.printer_id)? else {
            return Ok(());
        };
        if printer.current_task_id != Some(task.id) {
            return Ok(());
        }
        printer.release(task.id);
        // The device keeps reporting the stopped job's fault until the next start.
        if matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            printer.fault_acknowledged = true;
        }
        self.put_printer(&printer)
    }
}

/// Durable store.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for tests).
    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StoreResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TASKS_TABLE)?;
            let _ = write_txn.open_table(PRINTERS_TABLE)?;
            let _ = write_txn.open_table(QUEUE_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables<'_>) -> StoreResult<R>) -> StoreResult<R> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut tables = Tables::open(&txn)?;
            f(&mut tables)?
        };
        txn.commit()?;
        Ok(result)
    }

    // ========== Tasks ==========

    /// Store a new task.
    pub fn insert_task(&self, task: &PrintTask) -> StoreResult<()> {
        self.write(|t| {
            t.put_task(task)?;
            if t.sync_queue(None, task)? {
                t.renumber()?;
            }
            Ok(())
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: TaskId) -> StoreResult<Option<PrintTask>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        decode(&table, &id.to_string())
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> StoreResult<Vec<PrintTask>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        let mut tasks: Vec<PrintTask> = decode_all(&table)?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Tasks in any of `statuses`, oldest first.
    pub fn tasks_with_status(&self, statuses: &[TaskStatus]) -> StoreResult<Vec<PrintTask>> {
        let mut tasks = self.list_tasks()?;
        tasks.retain(|t| statuses.contains(&t.status));
        Ok(tasks)
    }

    /// Read-modify-write a task in one transaction.
    ///
    /// If `f` fails nothing is written. Leaving the queue drops the index
    /// entry; reaching a terminal state releases the printer.
    pub fn update_task<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut PrintTask) -> Result<R, TaskError>,
    ) -> StoreResult<(PrintTask, R)> {
        self.write(|t| {
            let mut task = t.require_task(id)?;
            let before = queue_entry(&task);
            let was_terminal = task.is_terminal();

            let result = f(&mut task)?;

            t.put_task(&task)?;
            if t.sync_queue(before, &task)? {
                t.renumber()?;
                if let Some(fresh) = t.task(id)? {
                    task = fresh;
                }
            }
            if task.is_terminal() && !was_terminal {
                t.release_printer(&task)?;
            }
            Ok((task, result))
        })
    }

    /// Delete terminal tasks that ended before `cutoff`. Returns how many.
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.write(|t| {
            let tasks: Vec<PrintTask> = decode_all(&t.tasks)?;
            let expired: Vec<String> = tasks
                .into_iter()
                .filter(|task| task.is_terminal() && task.ended_at.is_some_and(|at| at < cutoff))
                .map(|task| task.id.to_string())
                .collect();
            for id in &expired {
                t.tasks.remove(id.as_str())?;
            }
            Ok(expired.len())
        })
    }

    // ========== Printers ==========

    /// Insert a printer, or update its registration while keeping runtime state.
    pub fn register_printer(&self, printer: &Printer) -> StoreResult<Printer> {
        self.write(|t| {
            let mut stored = printer.clone();
            if let Some(existing) = t.printer(&printer.id)? {
                stored.status = existing.status;
                stored.current_task_id = existing.current_task_id;
                stored.last_heartbeat = existing.last_heartbeat;
                stored.fault_acknowledged = existing.fault_acknowledged;
            }
            t.put_printer(&stored)?;
            Ok(stored)
        })
    }

    /// Get a printer by ID.
    pub fn get_printer(&self, id: &str) -> StoreResult<Option<Printer>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRINTERS_TABLE)?;
        decode(&table, id)
    }

    /// All printers, by ID.
    pub fn list_printers(&self) -> StoreResult<Vec<Printer>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRINTERS_TABLE)?;
        let mut printers: Vec<Printer> = decode_all(&table)?;
        printers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(printers)
    }

    /// Read-modify-write a printer in one transaction.
    pub fn update_printer<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Printer) -> R,
    ) -> StoreResult<(Printer, R)> {
        self.write(|t| {
            let mut printer = t
                .printer(id)?
                .ok_or_else(|| StoreError::PrinterNotFound(id.to_string()))?;
            let result = f(&mut printer);
            t.put_printer(&printer)?;
            Ok((printer, result))
        })
    }

    /// Attach a task to a printer.
    ///
    /// Fails with [`StoreError::DuplicateAssignment`] when a live task already
    /// holds it. A reference to a finished task is cleared.
    pub fn assign(&self, task_id: TaskId, printer_id: &str) -> StoreResult<Printer> {
        self.write(|t| {
            let mut printer = t
                .printer(printer_id)?
                .ok_or_else(|| StoreError::PrinterNotFound(printer_id.to_string()))?;

            if let Some(current) = printer.current_task_id.filter(|c| *c != task_id) {
                let live = t.task(current)?.is_some_and(|c| !c.is_terminal());
                if live {
                    return Err(StoreError::DuplicateAssignment {
                        printer_id: printer_id.to_string(),
                        current,
                        requested: task_id,
                    });
                }
                tracing::warn!(printer_id, task_id = %current, "Clearing stale printer assignment");
                printer.current_task_id = None;
            }

            printer.assign(task_id)?;
            t.put_printer(&printer)?;
            Ok(printer)
        })
    }

    /// Detach a task from a printer without touching the task.
    pub fn release(&self, task_id: TaskId, printer_id: &str) -> StoreResult<()> {
        self.write(|t| {
            if let Some(mut printer) = t.printer(printer_id)? {
                if printer.current_task_id == Some(task_id) {
                    printer.release(task_id);
                    t.put_printer(&printer)?;
                }
            }
            Ok(())
        })
    }

    // ========== Queue ==========

    /// Put a prepared task at the back of its priority band.
    pub(crate) fn enqueue(&self, id: TaskId, priority: i32) -> StoreResult<u32> {
        self.write(|t| {
            let mut task = t.require_task(id)?;
            let key = QueueKey {
                priority,
                sequence: t.next_sequence()?,
            };
            task.enqueue(key, 1)?;
            Self::insert_queued(t, &task)
        })
    }

    /// Put a dequeued task back under its original key.
    pub(crate) fn requeue(&self, id: TaskId) -> StoreResult<u32> {
        self.write(|t| {
            let mut task = t.require_task(id)?;
            let key = match task.queue_key {
                Some(key) => key,
                None => QueueKey {
                    priority: task.priority,
                    sequence: t.next_sequence()?,
                },
            };
            task.enqueue(key, 1)?;
            Self::insert_queued(t, &task)
        })
    }

    fn insert_queued(t: &mut Tables<'_>, task: &PrintTask) -> StoreResult<u32> {
        t.put_task(task)?;
        t.sync_queue(None, task)?;
        let order = t.renumber()?;
        let id = task.id.to_string();
        let position = order.iter().position(|queued| *queued == id).unwrap_or(0);
        Ok(position as u32 + 1)
    }

    /// Take the first queued task accepted by `matches` and mark it dispatching.
    pub(crate) fn dequeue(
        &self,
        matches: impl Fn(&PrintTask) -> bool,
    ) -> StoreResult<Option<PrintTask>> {
        self.write(|t| {
            let mut stale = Vec::new();
            let mut chosen = None;
            for entry in t.queue.iter()? {
                let (key, _) = entry?;
                let (rank, sequence, id) = key.value();
                let task: Option<PrintTask> = decode(&t.tasks, id)?;
                match task {
                    Some(task) if task.status == TaskStatus::Queued => {
                        if matches(&task) {
                            chosen = Some(((rank, sequence, id.to_string()), task));
                            break;
                        }
                    }
                    _ => stale.push((rank, sequence, id.to_string())),
                }
            }

            for (rank, sequence, id) in &stale {
                tracing::warn!(task_id = %id, "Dropping stale queue entry");
                t.queue.remove((*rank, *sequence, id.as_str()))?;
            }

            let Some(((rank, sequence, id), mut task)) = chosen else {
                if !stale.is_empty() {
                    t.renumber()?;
                }
                return Ok(None);
            };

            t.queue.remove((rank, sequence, id.as_str()))?;
            task.begin_dispatch()?;
            t.put_task(&task)?;
            t.renumber()?;
            Ok(Some(task))
        })
    }

    /// Change a queued task's priority, keeping its arrival order within the
    /// new band. Returns the new position, or `None` if the task is not queued.
    pub(crate) fn reprioritize(&self, id: TaskId, priority: i32) -> StoreResult<Option<u32>> {
        self.write(|t| {
            let mut task = t.require_task(id)?;
            let before = queue_entry(&task);
            let Some(key) = task.queue_key.filter(|_| before.is_some()) else {
                return Ok(None);
            };

            let key = QueueKey { priority, ..key };
            task.priority = priority;
            task.queue_key = Some(key);
            t.put_task(&task)?;
            t.sync_queue(before, &task)?;

            let order = t.renumber()?;
            let id = id.to_string();
            Ok(order.iter().position(|queued| *queued == id).map(|p| p as u32 + 1))
        })
    }

    /// Number of queued tasks.
    pub(crate) fn queue_len(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        Ok(table.len()?)
    }

    /// The first `limit` queued tasks, in dequeue order.
    pub(crate) fn queue_head(&self, limit: usize) -> StoreResult<Vec<PrintTask>> {
        let read_txn = self.db.begin_read()?;
        let queue = read_txn.open_table(QUEUE_TABLE)?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;

        let mut head = Vec::new();
        for entry in queue.iter()? {
            if head.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let (_, _, id) = key.value();
            if let Some(task) = decode::<_, PrintTask>(&tasks, id)? {
                head.push(task);
            }
        }
        Ok(head)
    }
}
