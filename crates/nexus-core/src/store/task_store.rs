//! Task store with optimistic concurrency control.
//!
//! Every mutation goes through a watch-then-transact loop against the
//! [`TaskBackend`]: watch the task key, read and recompute, then commit only
//! if nothing else wrote the key in between. Rejected commits are retried a
//! bounded number of times with exponential backoff.
//!
//! Key schema (all keys share one TTL, refreshed on every write):
//!
//! | Key | Kind | Content |
//! |-----|------|---------|
//! | `{prefix}:task:{id}` | hash | `data` (task JSON), `version`, `status`, `type` |
//! | `{prefix}:tasks:type:{type}` | set | task ids |
//! | `{prefix}:tasks:status:{status}` | set | task ids |
//! | `{prefix}:tasks:all` | sorted set | task ids scored by `createdAt` (epoch ms) |

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use nexus_types::config::StoreConfig;
use nexus_types::error::RepositoryError;
use nexus_types::task::{Task, TaskPage, TaskStatus, TaskUpdate, TaskUpdateError};

use super::backend::{StoredRecord, TaskBackend, WriteOp};
use crate::delay::{DelayFn, exponential_backoff, tokio_delay};

const FIELD_DATA: &str = "data";
const FIELD_VERSION: &str = "version";
const FIELD_STATUS: &str = "status";
const FIELD_TYPE: &str = "type";

/// Errors surfaced by [`TaskStore`] operations.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    /// The caller's `expected_version` is stale; refresh and retry intentionally.
    #[error("version conflict on task {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("optimistic lock failed on task {id} after {attempts} attempts")]
    OptimisticLockFailed { id: String, attempts: u32 },

    #[error("invalid task update: {0}")]
    InvalidUpdate(#[from] TaskUpdateError),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Concurrency-safe task persistence over a [`TaskBackend`].
pub struct TaskStore<B: TaskBackend> {
    backend: B,
    prefix: String,
    ttl: Duration,
    max_retries: u32,
    retry_delay: Duration,
    delay: DelayFn,
}

impl<B: TaskBackend> TaskStore<B> {
    pub fn new(backend: B, config: &StoreConfig) -> Self {
        Self {
            backend,
            prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            delay: tokio_delay(),
        }
    }

    /// Replace the delay used between optimistic-lock retries.
    pub fn with_delay(mut self, delay: DelayFn) -> Self {
        self.delay = delay;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    pub fn task_key(&self, id: &str) -> String {
        format!("{}:task:{id}", self.prefix)
    }

    fn type_key(&self, task_type: &str) -> String {
        format!("{}:tasks:type:{task_type}", self.prefix)
    }

    fn status_key(&self, status: TaskStatus) -> String {
        format!("{}:tasks:status:{status}", self.prefix)
    }

    fn all_key(&self) -> String {
        format!("{}:tasks:all", self.prefix)
    }

    fn expire(&self, key: String) -> WriteOp {
        WriteOp::Expire { key, ttl: self.ttl }
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    fn encode(&self, task: &Task) -> Result<WriteOp, RepositoryError> {
        let data = serde_json::to_string(task)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        Ok(WriteOp::PutRecord {
            key: self.task_key(&task.id),
            fields: vec![
                (FIELD_DATA.to_string(), data),
                (FIELD_VERSION.to_string(), task.version.to_string()),
                (FIELD_STATUS.to_string(), task.status.to_string()),
                (FIELD_TYPE.to_string(), task.task_type.clone()),
            ],
        })
    }

    fn decode(id: &str, record: &StoredRecord) -> Result<Task, RepositoryError> {
        let data = record.get(FIELD_DATA).ok_or_else(|| {
            RepositoryError::Serialization(format!("task {id} record has no data field"))
        })?;
        let mut task: Task = serde_json::from_str(data)
            .map_err(|e| RepositoryError::Serialization(format!("task {id}: {e}")))?;
        if let Some(version) = record.get(FIELD_VERSION) {
            task.version = version.parse().map_err(|_| {
                RepositoryError::Serialization(format!("task {id} has invalid version '{version}'"))
            })?;
        }
        Ok(task)
    }

    /// Writes for a full task record, its index memberships and TTL refresh.
    fn record_ops(&self, task: &Task) -> Result<Vec<WriteOp>, RepositoryError> {
        let task_key = self.task_key(&task.id);
        let type_key = self.type_key(&task.task_type);
        let status_key = self.status_key(task.status);
        let all_key = self.all_key();
        Ok(vec![
            self.encode(task)?,
            WriteOp::SetAdd {
                key: type_key.clone(),
                member: task.id.clone(),
            },
            WriteOp::SetAdd {
                key: status_key.clone(),
                member: task.id.clone(),
            },
            WriteOp::SortedAdd {
                key: all_key.clone(),
                member: task.id.clone(),
                score: task.created_at.timestamp_millis() as f64,
            },
            self.expire(task_key),
            self.expire(type_key),
            self.expire(status_key),
            self.expire(all_key),
        ])
    }

    async fn backoff(&self, id: &str, attempt: u32, operation: &str) {
        let delay = exponential_backoff(self.retry_delay, attempt, None);
        tracing::warn!(
            task_id = %id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            operation,
            "optimistic lock commit rejected, retrying"
        );
        (self.delay)(delay).await;
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Persist a new task with its index memberships in one atomic batch.
    ///
    /// The stored task's version is `task.version + 1` (1 for a task built
    /// with [`Task::new`]). Fails with `AlreadyExists` if the id is taken.
    pub async fn save(&self, task: &Task) -> Result<Task, TaskStoreError> {
        let key = self.task_key(&task.id);
        let (token, existing) = self.backend.watch(&key).await?;
        if existing.is_some() {
            return Err(TaskStoreError::AlreadyExists(task.id.clone()));
        }

        let mut stored = task.clone();
        stored.version = task.version + 1;
        let ops = self.record_ops(&stored)?;

        let committed = self
            .backend
            .commit_watched(token, ops)
            .await
            .map_err(|e| RepositoryError::SaveFailed(e.to_string()))?;
        if !committed {
            return Err(RepositoryError::SaveFailed(format!(
                "task {} was written concurrently during save",
                task.id
            ))
            .into());
        }

        tracing::debug!(task_id = %stored.id, task_type = %stored.task_type, "saved task");
        Ok(stored)
    }

    /// Fetch a task by id. A missing (or expired) task is `Ok(None)`.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>, TaskStoreError> {
        match self.backend.get(&self.task_key(id)).await? {
            Some(record) => Ok(Some(Self::decode(id, &record)?)),
            None => Ok(None),
        }
    }

    /// Merge `update` into the stored task under optimistic locking.
    ///
    /// With `expected_version`, a stale version fails fast with `Conflict`.
    /// A rejected commit is retried up to `max_retries` times, after which
    /// the call fails with `OptimisticLockFailed`. A status change moves the
    /// task between status indices in the same commit.
    pub async fn update(
        &self,
        id: &str,
        update: &TaskUpdate,
        expected_version: Option<u64>,
    ) -> Result<Task, TaskStoreError> {
        let key = self.task_key(id);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let (token, snapshot) = self.backend.watch(&key).await?;
            let Some(record) = snapshot else {
                return Err(TaskStoreError::NotFound(id.to_string()));
            };
            let current = Self::decode(id, &record)?;

            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(TaskStoreError::Conflict {
                        id: id.to_string(),
                        expected,
                        actual: current.version,
                    });
                }
            }

            let next = current.apply(update, Utc::now())?;
            let status_key = self.status_key(next.status);
            let mut ops = vec![self.encode(&next)?];
            if next.status != current.status {
                ops.push(WriteOp::SetRemove {
                    key: self.status_key(current.status),
                    member: id.to_string(),
                });
                ops.push(WriteOp::SetAdd {
                    key: status_key.clone(),
                    member: id.to_string(),
                });
            }
            ops.extend([
                self.expire(key.clone()),
                self.expire(self.type_key(&next.task_type)),
                self.expire(status_key),
                self.expire(self.all_key()),
            ]);

            let committed = self
                .backend
                .commit_watched(token, ops)
                .await
                .map_err(|e| RepositoryError::UpdateFailed(e.to_string()))?;
            if committed {
                tracing::debug!(
                    task_id = %id,
                    version = next.version,
                    status = %next.status,
                    "updated task"
                );
                return Ok(next);
            }

            if attempt > self.max_retries {
                return Err(TaskStoreError::OptimisticLockFailed {
                    id: id.to_string(),
                    attempts: attempt,
                });
            }
            self.backoff(id, attempt, "update").await;
        }
    }

    /// Remove a task and all its index memberships. Returns `false` if the
    /// task did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, TaskStoreError> {
        let key = self.task_key(id);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let (token, snapshot) = self.backend.watch(&key).await?;
            let Some(record) = snapshot else {
                return Ok(false);
            };

            let mut ops = vec![
                WriteOp::DeleteKey { key: key.clone() },
                WriteOp::SortedRemove {
                    key: self.all_key(),
                    member: id.to_string(),
                },
            ];
            if let Some(task_type) = record.get(FIELD_TYPE) {
                ops.push(WriteOp::SetRemove {
                    key: self.type_key(task_type),
                    member: id.to_string(),
                });
            }
            if let Some(status) = record.get(FIELD_STATUS).and_then(|s| s.parse().ok()) {
                ops.push(WriteOp::SetRemove {
                    key: self.status_key(status),
                    member: id.to_string(),
                });
            }

            let committed = self
                .backend
                .commit_watched(token, ops)
                .await
                .map_err(|e| RepositoryError::DeleteFailed(e.to_string()))?;
            if committed {
                tracing::debug!(task_id = %id, "deleted task");
                return Ok(true);
            }

            if attempt > self.max_retries {
                return Err(TaskStoreError::OptimisticLockFailed {
                    id: id.to_string(),
                    attempts: attempt,
                });
            }
            self.backoff(id, attempt, "delete").await;
        }
    }

    /// Newest-first page over the time-ordered index.
    ///
    /// `cursor` is the value returned as `next_cursor` by the previous page.
    /// Tasks deleted or expired between scan and fetch are dropped.
    pub async fn list(&self, cursor: Option<&str>, limit: usize) -> Result<TaskPage, TaskStoreError> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| TaskStoreError::InvalidCursor(c.to_string()))?,
            None => 0,
        };
        if limit == 0 {
            return Ok(TaskPage {
                tasks: Vec::new(),
                next_cursor: None,
            });
        }

        let mut ids = self
            .backend
            .sorted_range_desc(&self.all_key(), offset, limit + 1)
            .await?;
        let has_more = ids.len() > limit;
        ids.truncate(limit);

        let tasks = self.fetch_many(&ids).await?;
        Ok(TaskPage {
            tasks,
            next_cursor: has_more.then(|| (offset + limit).to_string()),
        })
    }

    /// Newest tasks of a given type, best-effort.
    pub async fn find_by_type(&self, task_type: &str, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        self.find_in_index(&self.type_key(task_type), limit).await
    }

    /// Newest tasks with a given status, best-effort.
    pub async fn find_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        self.find_in_index(&self.status_key(status), limit).await
    }

    async fn find_in_index(&self, index_key: &str, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let mut ids = self.backend.set_members(index_key).await?;
        // UUIDv7 ids sort by creation time.
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(limit);
        self.fetch_many(&ids).await
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Task>, TaskStoreError> {
        let keys: Vec<String> = ids.iter().map(|id| self.task_key(id)).collect();
        let records = self.backend.get_many(&keys).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for (id, record) in ids.iter().zip(records) {
            if let Some(record) = record {
                tasks.push(Self::decode(id, &record)?);
            }
        }
        Ok(tasks)
    }

    /// Trim time-index entries older than `now - ttl`. Returns the count removed.
    ///
    /// This only trims the index; task records expire through their own TTL.
    pub async fn cleanup(&self) -> Result<u64, TaskStoreError> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(ttl_ms);
        let removed = self
            .backend
            .sorted_remove_below(&self.all_key(), cutoff as f64)
            .await?;
        tracing::info!(removed, cutoff_ms = cutoff, "trimmed task index");
        Ok(removed)
    }

    /// Number of tasks in the time-ordered index.
    pub async fn count(&self) -> Result<u64, TaskStoreError> {
        Ok(self.backend.sorted_card(&self.all_key()).await?)
    }

    pub async fn health_check(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "task store health check failed");
                false
            }
        }
    }
}
