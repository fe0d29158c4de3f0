//! Mirrors a workflow run onto a stored task.
//!
//! The task moves `pending -> running` when execution starts, receives a
//! progress percentage after every parallel group, and ends `completed`
//! (successful or degraded run) or `failed`. The serialized
//! [`WorkflowResult`] is stored as the task result either way.

use serde::Serialize;
use serde_json::Value;

use nexus_types::error::RepositoryError;
use nexus_types::task::{Task, TaskStatus, TaskUpdate};
use nexus_types::workflow::WorkflowResult;

use super::executor::GroupObserver;
use crate::store::{TaskBackend, TaskStore, TaskStoreError};

// ---------------------------------------------------------------------------
// TaskCheckpointer
// ---------------------------------------------------------------------------

/// Records workflow lifecycle transitions on one task.
pub struct TaskCheckpointer<'a, B: TaskBackend> {
    store: &'a TaskStore<B>,
    task_id: String,
}

impl<'a, B: TaskBackend> TaskCheckpointer<'a, B> {
    pub fn new(store: &'a TaskStore<B>, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Mark the task running with zero progress.
    pub async fn start(&self) -> Result<Task, TaskStoreError> {
        let update = TaskUpdate {
            status: Some(TaskStatus::Running),
            progress: Some(0),
            ..TaskUpdate::default()
        };
        self.store.update(&self.task_id, &update, None).await
    }

    /// Record the final result. Only a `failed` workflow fails the task.
    pub async fn finish(&self, result: &WorkflowResult) -> Result<Task, TaskStoreError> {
        let value = result_value(result)?;
        let update = if result.success {
            TaskUpdate::completed(value)
        } else {
            TaskUpdate {
                result: Some(value),
                ..TaskUpdate::failed(result.summary.clone())
            }
        };
        let task = self.store.update(&self.task_id, &update, None).await?;
        tracing::info!(
            task_id = %self.task_id,
            plan_id = %result.plan_id,
            status = %task.status,
            "workflow result recorded"
        );
        Ok(task)
    }

    /// Mark the task failed when the workflow could not run at all.
    pub async fn fail(&self, error: &str) -> Result<Task, TaskStoreError> {
        self.store
            .update(&self.task_id, &TaskUpdate::failed(error), None)
            .await
    }
}

fn result_value(result: &impl Serialize) -> Result<Value, TaskStoreError> {
    serde_json::to_value(result)
        .map_err(|e| RepositoryError::Serialization(format!("workflow result: {e}")).into())
}

impl<B: TaskBackend> GroupObserver for TaskCheckpointer<'_, B> {
    async fn group_finished(&self, finished: usize, total: usize) {
        if total == 0 {
            return;
        }
        // 100 is reserved for the terminal update.
        let progress = (finished * 100 / total).min(99) as u8;
        if let Err(e) = self
            .store
            .update(&self.task_id, &TaskUpdate::progress(progress), None)
            .await
        {
            tracing::warn!(
                task_id = %self.task_id,
                progress,
                error = %e,
                "failed to record workflow progress"
            );
        }
    }
}
