//! `nexus plan` and `nexus run`.
//!
//! Both read a candidate step list from a JSON file and feed it to the
//! planner through a [`StaticPlanningClient`]. `run` then executes the plan
//! against the configured HTTP services.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use nexus_core::workflow::{
    CandidatePlan, DagExecutor, PlanOptions, PlanningOutcome, ProgressBus, StaticPlanningClient, TaskCheckpointer,
    WorkflowExecutor, WorkflowPlanner,
};
use nexus_types::event::WorkflowProgressEvent;
use nexus_types::service::ServiceId;
use nexus_types::task::Task;

use super::{PlanArgs, RunArgs, print_json};
use crate::state::AppState;

/// Task type recorded for tracked runs.
const WORKFLOW_TASK_TYPE: &str = "workflow";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub async fn handle_plan(args: PlanArgs, state: &AppState) -> Result<()> {
    let outcome = plan(&args, state).await?;
    print_json(&outcome)
}

async fn plan(args: &PlanArgs, state: &AppState) -> Result<PlanningOutcome> {
    let candidate = load_candidate(&args.candidate).await?;
    let request = args
        .request
        .clone()
        .unwrap_or_else(|| format!("workflow from {}", args.candidate.display()));

    let service_timeouts: HashMap<ServiceId, Duration> = state
        .config
        .services
        .iter()
        .filter_map(|(name, endpoint)| {
            let id = name.parse::<ServiceId>().ok()?;
            Some((id, Duration::from_millis(endpoint.timeout_ms)))
        })
        .collect();
    let planner = WorkflowPlanner::new(StaticPlanningClient::new(candidate), state.config.planner.clone())
        .with_service_timeouts(service_timeouts);

    let options = PlanOptions {
        mode: args.mode.map(Into::into),
        timeout_ms: args.timeout_ms,
        ..PlanOptions::default()
    };
    let outcome = planner
        .parse_request(&request, None, options)
        .await
        .context("Planning failed")?;

    tracing::info!(
        plan_id = %outcome.plan.id,
        steps = outcome.plan.steps.len(),
        groups = outcome.plan.parallel_groups.len(),
        confidence = outcome.confidence,
        "plan built"
    );
    Ok(outcome)
}

async fn load_candidate(path: &Path) -> Result<CandidatePlan> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid candidate JSON in {}", path.display()))
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(args: RunArgs, state: &AppState) -> Result<()> {
    let outcome = plan(&args.plan, state).await?;
    if outcome.needs_clarification() && !args.force {
        print_json(&outcome)?;
        bail!("The planner needs clarification before running; re-run with --force to execute anyway");
    }

    let bus = ProgressBus::new(state.config.executor.progress_capacity);
    let logger = tokio::spawn(log_progress(bus.subscribe()));
    let executor = DagExecutor::new(state.service_registry()?, &state.config.executor).with_progress(Arc::new(bus));

    let result = if args.track {
        let store = state.task_store().await?;
        let task = Task::new(
            WORKFLOW_TASK_TYPE,
            json!({
                "planId": outcome.plan.id,
                "request": outcome.plan.original_request,
            }),
        );
        let task = store.save(&task).await.context("Failed to create task")?;
        tracing::info!(task_id = %task.id, plan_id = %outcome.plan.id, "tracking run as task");
        let checkpointer = TaskCheckpointer::new(&store, task.id);
        executor.execute_tracked(&outcome.plan, &checkpointer).await?
    } else {
        executor.execute_workflow(&outcome.plan).await?
    };
    // Closing the bus lets the logger drain queued events and exit.
    drop(executor);
    match logger.await {
        Ok(logged) => tracing::debug!(logged, "progress log drained"),
        Err(e) => tracing::warn!(error = %e, "progress logger task failed"),
    }

    print_json(&result)?;
    if !result.success {
        bail!("{}", result.summary);
    }
    Ok(())
}

/// Mirror progress events into the log until the bus closes. Returns the
/// number of events logged.
async fn log_progress(mut rx: broadcast::Receiver<WorkflowProgressEvent>) -> usize {
    let mut logged = 0;
    loop {
        match rx.recv().await {
            Ok(WorkflowProgressEvent::StepFailed {
                step_id,
                error,
                will_retry,
                ..
            }) => {
                tracing::warn!(step_id = %step_id, will_retry, error = %error, "step failed");
                logged += 1;
            }
            Ok(event) => {
                tracing::info!(
                    plan_id = %event.plan_id(),
                    step_id = event.step_id().unwrap_or("-"),
                    event = ?event,
                    "workflow progress"
                );
                logged += 1;
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "progress log lagging, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use nexus_types::config::OrchestratorConfig;
    use nexus_types::workflow::{ExecutionMode, WorkflowStatus};

    use crate::cli::ModeArg;

    fn state() -> AppState {
        AppState {
            config: OrchestratorConfig::default(),
        }
    }

    fn candidate_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_plan_from_candidate_file() {
        let file = candidate_file(
            r#"{
                "steps": [
                    {"id": "extract", "service": "fileprocess", "operation": "extract"},
                    {"id": "summarize", "service": "mageagent", "operation": "summarize",
                     "dependsOn": ["extract"], "input": {"text": "${ref:extract.text}"}}
                ],
                "confidence": 0.95
            }"#,
        );
        let args = PlanArgs {
            candidate: file.path().to_path_buf(),
            request: Some("summarize the upload".to_string()),
            mode: Some(ModeArg::BestEffort),
            timeout_ms: Some(60_000),
        };

        let outcome = plan(&args, &state()).await.unwrap();
        assert_eq!(outcome.plan.parallel_groups, vec![vec!["extract"], vec!["summarize"]]);
        assert_eq!(outcome.plan.mode, ExecutionMode::BestEffort);
        assert_eq!(outcome.plan.timeout_ms, 60_000);
        assert_eq!(outcome.plan.original_request, "summarize the upload");
        assert!(!outcome.needs_clarification());
    }

    #[tokio::test]
    async fn test_plan_rejects_cycle() {
        let file = candidate_file(
            r#"{"steps": [
                {"id": "a", "service": "sandbox", "operation": "run", "dependsOn": ["b"]},
                {"id": "b", "service": "sandbox", "operation": "run", "dependsOn": ["a"]}
            ], "confidence": 0.9}"#,
        );
        let args = PlanArgs {
            candidate: file.path().to_path_buf(),
            request: None,
            mode: None,
            timeout_ms: None,
        };
        let err = plan(&args, &state()).await.unwrap_err();
        assert!(format!("{err:#}").contains("cycle"));
    }

    #[tokio::test]
    async fn test_progress_log_drains_queued_events_after_close() {
        let bus = ProgressBus::new(16);
        let logger = tokio::spawn(log_progress(bus.subscribe()));
        bus.publish(WorkflowProgressEvent::StepStarted {
            plan_id: "plan".to_string(),
            step_id: "extract".to_string(),
            service: ServiceId::Fileprocess,
            operation: "extract".to_string(),
            attempt: 1,
        });
        bus.publish(WorkflowProgressEvent::WorkflowCompleted {
            plan_id: "plan".to_string(),
            status: WorkflowStatus::Completed,
            duration_ms: 12,
        });
        drop(bus);

        let logged = tokio::time::timeout(Duration::from_secs(5), logger)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged, 2);
    }

    #[tokio::test]
    async fn test_invalid_candidate_json() {
        let file = candidate_file("not json");
        let err = load_candidate(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid candidate JSON"));
    }
}
