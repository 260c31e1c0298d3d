//! Ingestion and rebuild task tracking.
//!
//! Workers report through a [`TaskHandle`] that sends [`TaskUpdate`]s over a
//! channel; the [`TaskTracker`] applies them in order whenever status is read.

pub mod manager;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

pub use manager::{ItemReporter, TaskHandle, TaskTracker};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ingest,
    Rebuild,
}

impl TaskKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskKind::Ingest => "Ingest",
            TaskKind::Rebuild => "Rebuild",
        }
    }
}

/// `Idle` until the first task starts. A finished task stays visible in its
/// terminal state until the next one begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed(String),
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Update messages sent from a running task.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// Work on an item began.
    ItemStarted { item: String },
    /// An item finished without error.
    ItemDone {
        faces: usize,
        observations_skipped: usize,
        duplicate: bool,
    },
    /// An item failed; the batch continues.
    ItemFailed { item: String, error: String },
    /// Absolute progress, for work that is not item based.
    Progress { processed: usize },
    Completed,
    Failed { error: String },
}

/// Point-in-time view of the current (or last) task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Option<TaskId>,
    pub kind: Option<TaskKind>,
    pub state: TaskState,
    pub total: usize,
    pub processed: usize,
    pub current_item: Option<String>,
    pub errors: Vec<String>,
    pub faces_found: usize,
    pub photos_without_faces: usize,
    pub duplicates_skipped: usize,
    pub observations_skipped: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn idle() -> Self {
        Self {
            task_id: None,
            kind: None,
            state: TaskState::Idle,
            total: 0,
            processed: 0,
            current_item: None,
            errors: Vec::new(),
            faces_found: 0,
            photos_without_faces: 0,
            duplicates_skipped: 0,
            observations_skipped: 0,
            started_at: None,
            finished_at: None,
        }
    }

    fn running(id: TaskId, kind: TaskKind, total: usize) -> Self {
        Self {
            task_id: Some(id),
            kind: Some(kind),
            state: TaskState::Running,
            total,
            started_at: Some(Utc::now()),
            ..Self::idle()
        }
    }

    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.processed as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }

    fn apply(&mut self, update: TaskUpdate) {
        if !self.state.is_running() {
            return;
        }
        match update {
            TaskUpdate::ItemStarted { item } => {
                self.current_item = Some(item);
            }
            TaskUpdate::ItemDone {
                faces,
                observations_skipped,
                duplicate,
            } => {
                self.processed += 1;
                if duplicate {
                    self.duplicates_skipped += 1;
                } else {
                    self.faces_found += faces;
                    self.observations_skipped += observations_skipped;
                    if faces == 0 {
                        self.photos_without_faces += 1;
                    }
                }
            }
            TaskUpdate::ItemFailed { item, error } => {
                self.processed += 1;
                self.errors.push(format!("{}: {}", item, error));
            }
            TaskUpdate::Progress { processed } => {
                self.processed = processed.min(self.total);
            }
            TaskUpdate::Completed => {
                self.state = TaskState::Completed;
                self.current_item = None;
                self.finished_at = Some(Utc::now());
            }
            TaskUpdate::Failed { error } => {
                self.state = TaskState::Failed(error);
                self.current_item = None;
                self.finished_at = Some(Utc::now());
            }
        }
    }
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_counters() {
        let mut snap = TaskSnapshot::running(TaskId::new(), TaskKind::Ingest, 4);
        snap.apply(TaskUpdate::ItemStarted { item: "a.jpg".into() });
        snap.apply(TaskUpdate::ItemDone { faces: 2, observations_skipped: 1, duplicate: false });
        snap.apply(TaskUpdate::ItemDone { faces: 0, observations_skipped: 0, duplicate: false });
        snap.apply(TaskUpdate::ItemDone { faces: 0, observations_skipped: 0, duplicate: true });
        snap.apply(TaskUpdate::ItemFailed { item: "d.jpg".into(), error: "bad".into() });

        assert_eq!(snap.processed, 4);
        assert_eq!(snap.faces_found, 2);
        assert_eq!(snap.observations_skipped, 1);
        assert_eq!(snap.photos_without_faces, 1);
        assert_eq!(snap.duplicates_skipped, 1);
        assert_eq!(snap.errors, vec!["d.jpg: bad".to_string()]);
        assert_eq!(snap.current_item.as_deref(), Some("a.jpg"));
        assert_eq!(snap.percent(), 100);
    }

    #[test]
    fn test_terminal_state_ignores_late_updates() {
        let mut snap = TaskSnapshot::running(TaskId::new(), TaskKind::Rebuild, 2);
        snap.apply(TaskUpdate::Progress { processed: 5 });
        assert_eq!(snap.processed, 2);

        snap.apply(TaskUpdate::Completed);
        snap.apply(TaskUpdate::Failed { error: "late".into() });
        assert_eq!(snap.state, TaskState::Completed);
        assert!(snap.finished_at.is_some());
    }
}
