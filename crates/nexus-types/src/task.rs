//! Task domain types.
//!
//! A [`Task`] is a persisted unit of background work. Its `status` moves
//! forward through `pending -> running -> {completed | failed}` and its
//! `version` counts successful writes for optimistic concurrency control.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed. A pending task may fail
    /// without ever running (e.g. it was rejected before a worker picked it up),
    /// but it cannot complete without running first.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A persisted unit of background work.
///
/// Callers only ever hold copies; the task store owns the record and mutates
/// it exclusively through its compare-and-swap update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// UUIDv7 string (time-sortable).
    pub id: String,
    /// Free-form task type used for the type index (e.g. "workflow").
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    /// Input parameters supplied by the creator.
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion percentage, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Number of successful writes. `0` means the task was never persisted.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a new, unsaved pending task with a fresh UUIDv7 id.
    pub fn new(task_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            params,
            result: None,
            error: None,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: None,
            version: 0,
        }
    }

    /// Attach metadata (builder style).
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Apply a partial update, producing the next version of this task.
    ///
    /// Validates the status transition and the progress range, merges
    /// metadata keys, stamps `startedAt`/`completedAt` on lifecycle moves
    /// when the update does not supply them, and increments `version` by 1.
    pub fn apply(&self, update: &TaskUpdate, now: DateTime<Utc>) -> Result<Task, TaskUpdateError> {
        let mut next = self.clone();

        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                return Err(TaskUpdateError::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            if status != self.status {
                if status == TaskStatus::Running && next.started_at.is_none() {
                    next.started_at = Some(now);
                }
                if status.is_terminal() && next.completed_at.is_none() {
                    next.completed_at = Some(now);
                }
            }
            next.status = status;
        }

        if let Some(progress) = update.progress {
            if progress > 100 {
                return Err(TaskUpdateError::InvalidProgress(progress));
            }
            next.progress = Some(progress);
        }
        if let Some(result) = &update.result {
            next.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            next.error = Some(error.clone());
        }
        if let Some(started_at) = update.started_at {
            next.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            next.completed_at = Some(completed_at);
        }
        if let Some(metadata) = &update.metadata {
            let merged = next.metadata.get_or_insert_with(Map::new);
            for (key, value) in metadata {
                merged.insert(key.clone(), value.clone());
            }
        }

        next.version = self.version + 1;
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// TaskUpdate
// ---------------------------------------------------------------------------

/// A partial update merged into the stored task by the task store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Keys merged into the existing metadata map (shallow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// Mark the task completed with a result.
    pub fn completed(result: Value) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            result: Some(result),
            progress: Some(100),
            ..Self::default()
        }
    }

    /// Mark the task failed with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Errors raised while applying a [`TaskUpdate`] to a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskUpdateError {
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("progress must be between 0 and 100, got {0}")]
    InvalidProgress(u8),
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// One page of tasks from a cursor-based listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Cursor for the next page, `None` when the listing is exhausted.
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
