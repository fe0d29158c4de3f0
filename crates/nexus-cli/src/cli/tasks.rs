//! `nexus tasks ...` and `nexus health`.

use anyhow::{Result, bail};
use clap::Subcommand;
use serde_json::json;

use nexus_types::task::TaskStatus;

use super::print_json;
use crate::state::AppState;

/// Task inspection and maintenance subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// List tasks, newest first.
    List {
        /// Page size.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Cursor returned by a previous page.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Show one task.
    Get { id: String },

    /// Tasks of one type.
    ByType {
        task_type: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Tasks in one status (pending, running, completed, failed).
    ByStatus {
        #[arg(value_parser = parse_status)]
        status: TaskStatus,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete a task and its index entries.
    Delete { id: String },

    /// Trim index entries older than the configured TTL.
    Cleanup,

    /// Number of indexed tasks.
    Count,
}

fn parse_status(raw: &str) -> Result<TaskStatus, String> {
    TaskStatus::ALL
        .into_iter()
        .find(|s| s.as_str() == raw)
        .ok_or_else(|| format!("unknown status '{raw}'"))
}

/// Handle a task subcommand.
pub async fn handle_task_command(cmd: TaskCommand, state: &AppState) -> Result<()> {
    let store = state.task_store().await?;

    match cmd {
        TaskCommand::List { limit, cursor } => {
            let page = store.list(cursor.as_deref(), limit).await?;
            print_json(&page)
        }
        TaskCommand::Get { id } => match store.find_by_id(&id).await? {
            Some(task) => print_json(&task),
            None => bail!("Task '{id}' not found"),
        },
        TaskCommand::ByType { task_type, limit } => print_json(&store.find_by_type(&task_type, limit).await?),
        TaskCommand::ByStatus { status, limit } => print_json(&store.find_by_status(status, limit).await?),
        TaskCommand::Delete { id } => {
            if !store.delete(&id).await? {
                bail!("Task '{id}' not found");
            }
            print_json(&json!({ "deleted": id }))
        }
        TaskCommand::Cleanup => {
            let removed = store.cleanup().await?;
            tracing::info!(removed, "task index cleanup finished");
            print_json(&json!({ "removed": removed }))
        }
        TaskCommand::Count => print_json(&json!({ "count": store.count().await? })),
    }
}

/// Report backing store reachability; fails when unhealthy.
pub async fn handle_health(state: &AppState) -> Result<()> {
    let healthy = match state.task_store().await {
        Ok(store) => store.health_check().await,
        Err(e) => {
            tracing::warn!(error = %e, "backing store unreachable");
            false
        }
    };
    print_json(&json!({
        "store": if healthy { "ok" } else { "unreachable" },
        "redisUrl": state.config.store.redis_url,
    }))?;
    if !healthy {
        bail!("Backing store is unhealthy");
    }
    Ok(())
}
