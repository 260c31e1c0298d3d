//! Single-slot task tracker acting as the mutual-exclusion gate for
//! ingestion and rebuild.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard};

use super::{TaskId, TaskKind, TaskSnapshot, TaskUpdate};
use crate::error::{Error, Result};

struct Slot {
    snapshot: TaskSnapshot,
    receiver: Option<Receiver<TaskUpdate>>,
}

impl Slot {
    /// Apply every pending update in send order.
    fn drain(&mut self) {
        let Some(receiver) = &self.receiver else {
            return;
        };
        loop {
            match receiver.try_recv() {
                Ok(update) => self.snapshot.apply(update),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    // Every handle is gone; a still-running task never reported an outcome.
                    if self.snapshot.state.is_running() {
                        self.snapshot
                            .apply(TaskUpdate::Failed { error: "task ended without reporting".into() });
                    }
                    self.receiver = None;
                    return;
                }
            }
        }
    }
}

/// Tracks the current (or last) task. At most one task runs at a time.
pub struct TaskTracker {
    slot: Mutex<Slot>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                snapshot: TaskSnapshot::idle(),
                receiver: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a task, or fail with `TaskInProgress` if one is running.
    pub fn begin(&self, kind: TaskKind, total: usize) -> Result<TaskHandle> {
        let mut slot = self.lock();
        slot.drain();
        if slot.snapshot.state.is_running() {
            return Err(Error::TaskInProgress);
        }

        let (tx, rx) = mpsc::channel();
        let id = TaskId::new();
        slot.snapshot = TaskSnapshot::running(id, kind, total);
        slot.receiver = Some(rx);

        tracing::info!(task_id = %id, kind = kind.display_name(), total, "Task started");
        Ok(TaskHandle {
            id,
            kind,
            sender: tx,
            finished: false,
        })
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let mut slot = self.lock();
        slot.drain();
        slot.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().state.is_running()
    }

    /// Run `f` only if no task is running. No task can start until it returns.
    pub fn while_idle<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut slot = self.lock();
        slot.drain();
        if slot.snapshot.state.is_running() {
            return Err(Error::TaskInProgress);
        }
        f()
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to the running task. Dropping it before `complete` or
/// `fail` marks the task failed.
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    sender: Sender<TaskUpdate>,
    finished: bool,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// A cloneable sender for per-item progress from worker tasks.
    pub fn reporter(&self) -> ItemReporter {
        ItemReporter {
            sender: self.sender.clone(),
        }
    }

    pub fn item_done(&self, faces: usize, observations_skipped: usize) {
        self.send(TaskUpdate::ItemDone {
            faces,
            observations_skipped,
            duplicate: false,
        });
    }

    pub fn item_duplicate(&self) {
        self.send(TaskUpdate::ItemDone {
            faces: 0,
            observations_skipped: 0,
            duplicate: true,
        });
    }

    pub fn item_failed(&self, item: &str, error: &Error) {
        tracing::warn!(task_id = %self.id, item, error = %error, "Item failed");
        self.send(TaskUpdate::ItemFailed {
            item: item.to_string(),
            error: error.to_string(),
        });
    }

    pub fn progress(&self, processed: usize) {
        self.send(TaskUpdate::Progress { processed });
    }

    pub fn complete(mut self) {
        tracing::info!(task_id = %self.id, kind = self.kind.display_name(), "Task completed");
        self.send(TaskUpdate::Completed);
        self.finished = true;
    }

    pub fn fail(mut self, error: &Error) {
        tracing::error!(task_id = %self.id, kind = self.kind.display_name(), error = %error, "Task failed");
        self.send(TaskUpdate::Failed { error: error.to_string() });
        self.finished = true;
    }

    fn send(&self, update: TaskUpdate) {
        // The tracker owns the receiver for as long as it exists.
        let _ = self.sender.send(update);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(task_id = %self.id, "Task handle dropped before finishing");
            self.send(TaskUpdate::Failed {
                error: "task aborted".into(),
            });
        }
    }
}

/// Reports the item a worker is currently on.
#[derive(Clone)]
pub struct ItemReporter {
    sender: Sender<TaskUpdate>,
}

impl ItemReporter {
    pub fn item_started(&self, item: &str) {
        let _ = self.sender.send(TaskUpdate::ItemStarted { item: item.to_string() });
    }
}
