//! Workflow executor: wave-based parallel DAG execution.
//!
//! The `DagExecutor` walks a plan's parallel groups strictly in order. Steps
//! within a group run concurrently via `tokio::JoinSet`; a group starts only
//! after every step of the previous group reached a terminal status.
//!
//! # Execution flow
//!
//! 1. Check the plan is consistent and every service has a client.
//! 2. For each group: skip it entirely if the run was cancelled, halted
//!    (strict mode) or ran past the plan timeout.
//! 3. Resolve each ready step's input against completed outputs, then spawn
//!    it with its own timeout and retry loop.
//! 4. A failed step marks its transitive dependents `skipped`.
//! 5. Aggregate step results, failures, artifacts and metrics.
//!
//! Strict mode lets the group containing the first failure finish and then
//! starts no further groups. Best-effort mode only skips dependents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use nexus_types::config::ExecutorConfig;
use nexus_types::event::WorkflowProgressEvent;
use nexus_types::service::{Artifact, ServiceError, ServiceErrorKind, ServiceId, ServiceResponse};
use nexus_types::workflow::{
    ExecutionMode, FailedStep, StepResult, StepStatus, TenantContext, WorkflowMetrics, WorkflowPlan,
    WorkflowResult, WorkflowStatus, WorkflowStep,
};

use super::checkpoint::TaskCheckpointer;
use super::dag;
use super::progress::ProgressSink;
use super::reference::resolve_references;
use super::retry::{StepError, StepRetryPolicy};
use crate::delay::{DelayFn, tokio_delay};
use crate::service::{ExecuteOptions, ServiceRegistry};
use crate::store::{TaskBackend, TaskStoreError};

/// Fallback step timeout when neither the step nor its service sets one (5 minutes).
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a plan once and aggregate its result.
    fn execute_workflow(
        &self,
        plan: &WorkflowPlan,
    ) -> impl Future<Output = Result<WorkflowResult, ExecutorError>> + Send;
}

/// Called after each parallel group has settled.
pub trait GroupObserver: Send + Sync {
    fn group_finished(&self, finished: usize, total: usize) -> impl Future<Output = ()> + Send;
}

struct NoopObserver;

impl GroupObserver for NoopObserver {
    async fn group_finished(&self, _finished: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that prevent a plan from being executed at all.
///
/// Step failures are not errors: they are captured in the `WorkflowResult`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("inconsistent plan: {0}")]
    InvalidPlan(String),

    #[error("no client registered for service '{service}' (step '{step_id}')")]
    MissingClient { step_id: String, service: ServiceId },

    #[error("plan '{0}' is already executing")]
    AlreadyRunning(String),

    #[error("task checkpoint failed: {0}")]
    Checkpoint(#[from] TaskStoreError),
}

// ---------------------------------------------------------------------------
// Per-step bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StepState {
    status: StepStatus,
    data: Option<Value>,
    artifacts: Vec<Artifact>,
    error: Option<String>,
    attempts: u32,
    duration: Duration,
}

impl StepState {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            data: None,
            artifacts: Vec::new(),
            error: None,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }
}

/// What a spawned step reports back.
struct StepOutcome {
    step_id: String,
    result: Result<ServiceResponse, StepError>,
    attempts: u32,
    duration: Duration,
}

/// Everything a spawned step needs, owned so the task is `'static`.
struct StepRun {
    plan_id: String,
    step: WorkflowStep,
    input: Value,
    timeout: Duration,
    max_retries: u32,
    deadline: Instant,
    correlation_id: String,
    tenant: Option<TenantContext>,
    registry: Arc<ServiceRegistry>,
    progress: Option<Arc<dyn ProgressSink>>,
    policy: StepRetryPolicy,
    delay: DelayFn,
    token: CancellationToken,
}

impl StepRun {
    fn emit(&self, event: WorkflowProgressEvent) {
        if let Some(sink) = &self.progress {
            sink.emit(event);
        }
    }

    async fn attempt(&self) -> Result<ServiceResponse, StepError> {
        let service = self.step.service;
        let Some(client) = self.registry.get(service) else {
            return Err(StepError::Service(ServiceError::new(
                service,
                ServiceErrorKind::Unavailable,
                "no client registered",
            )));
        };

        // Never outlive the plan deadline.
        let limit = self.timeout.min(self.deadline.saturating_duration_since(Instant::now()));
        if limit.is_zero() {
            return Err(StepError::Timeout { timeout_ms: 0 });
        }
        let options = ExecuteOptions {
            timeout: limit,
            correlation_id: Some(self.correlation_id.clone()),
            tenant: self.tenant.clone(),
        };
        let call = client.execute(&self.step.operation, self.input.clone(), options);

        tokio::select! {
            _ = self.token.cancelled() => Err(StepError::Cancelled),
            result = tokio::time::timeout(limit, call) => match result {
                Ok(Ok(response)) if response.success => Ok(response),
                Ok(Ok(response)) => Err(StepError::Rejected {
                    service,
                    message: rejection_message(&response),
                }),
                Ok(Err(e)) => Err(StepError::Service(e)),
                Err(_elapsed) => Err(StepError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        }
    }

    async fn run(self) -> StepOutcome {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let result = loop {
            attempt += 1;
            self.emit(WorkflowProgressEvent::StepStarted {
                plan_id: self.plan_id.clone(),
                step_id: self.step.id.clone(),
                service: self.step.service,
                operation: self.step.operation.clone(),
                attempt,
            });
            tracing::debug!(
                plan_id = %self.plan_id,
                step_id = %self.step.id,
                service = %self.step.service,
                attempt,
                "step started"
            );

            let error = match self.attempt().await {
                Ok(response) => {
                    self.emit(WorkflowProgressEvent::StepCompleted {
                        plan_id: self.plan_id.clone(),
                        step_id: self.step.id.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    break Ok(response);
                }
                Err(e) => e,
            };

            let will_retry = self.policy.should_retry(&error, attempt, self.max_retries)
                && !self.token.is_cancelled()
                && Instant::now() < self.deadline;
            self.emit(WorkflowProgressEvent::StepFailed {
                plan_id: self.plan_id.clone(),
                step_id: self.step.id.clone(),
                error: error.to_string(),
                will_retry,
            });
            if !will_retry {
                break Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                plan_id = %self.plan_id,
                step_id = %self.step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying"
            );
            self.emit(WorkflowProgressEvent::StepProgress {
                plan_id: self.plan_id.clone(),
                step_id: self.step.id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                message: format!("retrying after: {error}"),
            });
            tokio::select! {
                _ = self.token.cancelled() => break Err(StepError::Cancelled),
                _ = (self.delay)(delay) => {}
            }
        };

        StepOutcome {
            step_id: self.step.id,
            result,
            attempts: attempt,
            duration: started.elapsed(),
        }
    }
}

fn rejection_message(response: &ServiceResponse) -> String {
    match response.data.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "service reported failure".to_string(),
    }
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Wave-based DAG executor dispatching steps through a [`ServiceRegistry`].
pub struct DagExecutor {
    registry: Arc<ServiceRegistry>,
    progress: Option<Arc<dyn ProgressSink>>,
    policy: StepRetryPolicy,
    default_step_timeout: Duration,
    delay: DelayFn,
    /// Cancellation tokens keyed by plan id.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl DagExecutor {
    pub fn new(registry: ServiceRegistry, config: &ExecutorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            progress: None,
            policy: StepRetryPolicy::from_config(config),
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            delay: tokio_delay(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Replace the delay used between step retries.
    pub fn with_delay(mut self, delay: DelayFn) -> Self {
        self.delay = delay;
        self
    }

    /// Timeout for steps whose service client does not provide a default.
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Cancel a running plan. In-flight steps fail as cancelled and steps
    /// not yet started are skipped. Returns `false` if the plan is not running.
    pub fn cancel(&self, plan_id: &str) -> bool {
        match self.cancellation_tokens.remove(plan_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(plan_id, "workflow cancelled");
                true
            }
            None => false,
        }
    }

    /// Execute `plan` while mirroring its lifecycle onto a stored task.
    ///
    /// The task moves to `running`, gets progress after every group, and ends
    /// `completed` (result = the serialized `WorkflowResult`) or `failed`.
    pub async fn execute_tracked<B: TaskBackend>(
        &self,
        plan: &WorkflowPlan,
        checkpointer: &TaskCheckpointer<'_, B>,
    ) -> Result<WorkflowResult, ExecutorError> {
        checkpointer.start().await?;
        match self.run(plan, checkpointer).await {
            Ok(result) => {
                checkpointer.finish(&result).await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(store_err) = checkpointer.fail(&e.to_string()).await {
                    tracing::warn!(
                        task_id = checkpointer.task_id(),
                        error = %store_err,
                        "failed to record workflow failure on task"
                    );
                }
                Err(e)
            }
        }
    }

    fn step_timeout(&self, step: &WorkflowStep) -> Duration {
        step.timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.registry.default_timeout(step.service))
            .unwrap_or(self.default_step_timeout)
    }

    fn check_plan(&self, plan: &WorkflowPlan) -> Result<(), ExecutorError> {
        let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != plan.steps.len() {
            return Err(ExecutorError::InvalidPlan("duplicate step ids".to_string()));
        }

        let mut grouped: HashSet<&str> = HashSet::new();
        for group in &plan.parallel_groups {
            for id in group {
                if !ids.contains(id.as_str()) {
                    return Err(ExecutorError::InvalidPlan(format!(
                        "group references unknown step '{id}'"
                    )));
                }
                if !grouped.insert(id.as_str()) {
                    return Err(ExecutorError::InvalidPlan(format!(
                        "step '{id}' appears in more than one group"
                    )));
                }
            }
        }
        if let Some(missing) = plan.steps.iter().find(|s| !grouped.contains(s.id.as_str())) {
            return Err(ExecutorError::InvalidPlan(format!(
                "step '{}' is not in any group",
                missing.id
            )));
        }

        for step in &plan.steps {
            if !self.registry.contains(step.service) {
                return Err(ExecutorError::MissingClient {
                    step_id: step.id.clone(),
                    service: step.service,
                });
            }
        }
        Ok(())
    }

    async fn run<O: GroupObserver>(
        &self,
        plan: &WorkflowPlan,
        observer: &O,
    ) -> Result<WorkflowResult, ExecutorError> {
        self.check_plan(plan)?;

        let token = CancellationToken::new();
        match self.cancellation_tokens.entry(plan.id.clone()) {
            Entry::Occupied(_) => return Err(ExecutorError::AlreadyRunning(plan.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        tracing::info!(
            plan_id = %plan.id,
            correlation_id = %plan.correlation_id,
            steps = plan.steps.len(),
            groups = plan.parallel_groups.len(),
            mode = %plan.mode,
            "starting workflow execution"
        );

        let started = Instant::now();
        let deadline = started + Duration::from_millis(plan.timeout_ms);
        let steps: HashMap<&str, &WorkflowStep> = plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut states: HashMap<String, StepState> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::pending()))
            .collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut failures: Vec<(FailedStep, StepError)> = Vec::new();
        let mut halted_by: Option<String> = None;
        let mut timed_out = false;
        let total_groups = plan.parallel_groups.len();

        for (group_idx, group) in plan.parallel_groups.iter().enumerate() {
            let stop_reason = if token.is_cancelled() {
                Some("not started: workflow cancelled".to_string())
            } else if let Some(failed) = &halted_by {
                Some(format!("not started: workflow halted after step '{failed}' failed (strict mode)"))
            } else if Instant::now() >= deadline {
                timed_out = true;
                Some(format!("not started: plan timeout of {} ms exceeded", plan.timeout_ms))
            } else {
                None
            };
            if let Some(reason) = stop_reason {
                skip_remaining(&plan.parallel_groups[group_idx..], &mut states, &reason);
                break;
            }

            tracing::debug!(plan_id = %plan.id, group = group_idx, steps = group.len(), "processing group");

            let mut join_set = JoinSet::new();
            let mut spawned: HashSet<String> = HashSet::new();

            for step_id in group {
                let step = steps[step_id.as_str()];
                if states[step_id].status != StepStatus::Pending {
                    continue;
                }
                let ready = step
                    .depends_on
                    .iter()
                    .all(|dep| states.get(dep).is_some_and(|s| s.status == StepStatus::Completed));
                if !ready {
                    mark_skipped(&mut states, step_id, "not started: a dependency did not complete");
                    continue;
                }

                if let Some(state) = states.get_mut(step_id) {
                    state.status = StepStatus::Ready;
                }
                let input = match resolve_references(&step.input, &outputs) {
                    Ok(input) => input,
                    Err(e) => {
                        let error = StepError::from(e);
                        if let Some(sink) = &self.progress {
                            sink.emit(WorkflowProgressEvent::StepFailed {
                                plan_id: plan.id.clone(),
                                step_id: step_id.clone(),
                                error: error.to_string(),
                                will_retry: false,
                            });
                        }
                        self.record_failure(plan, step, error, 0, Duration::ZERO, &mut states, &mut failures);
                        if plan.mode == ExecutionMode::Strict && halted_by.is_none() {
                            halted_by = Some(step_id.clone());
                        }
                        continue;
                    }
                };

                if let Some(state) = states.get_mut(step_id) {
                    state.status = StepStatus::Running;
                }
                let run = StepRun {
                    plan_id: plan.id.clone(),
                    step: step.clone(),
                    input,
                    timeout: self.step_timeout(step),
                    max_retries: self.policy.max_retries_for(step),
                    deadline,
                    correlation_id: plan.correlation_id.clone(),
                    tenant: plan.tenant_context.clone(),
                    registry: Arc::clone(&self.registry),
                    progress: self.progress.clone(),
                    policy: self.policy,
                    delay: Arc::clone(&self.delay),
                    token: token.child_token(),
                };
                spawned.insert(step_id.clone());
                join_set.spawn(run.run());
            }

            while let Some(joined) = join_set.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(plan_id = %plan.id, error = %e, "step task failed to join");
                        continue;
                    }
                };
                spawned.remove(&outcome.step_id);
                let step = steps[outcome.step_id.as_str()];

                match outcome.result {
                    Ok(response) => {
                        tracing::debug!(
                            plan_id = %plan.id,
                            step_id = %step.id,
                            attempts = outcome.attempts,
                            "step completed"
                        );
                        if let Some(state) = states.get_mut(&outcome.step_id) {
                            state.status = StepStatus::Completed;
                            state.data = Some(response.data.clone());
                            state.artifacts = response.artifacts;
                            state.attempts = outcome.attempts;
                            state.duration = outcome.duration;
                        }
                        outputs.insert(outcome.step_id, response.data);
                    }
                    Err(error) => {
                        self.record_failure(
                            plan,
                            step,
                            error,
                            outcome.attempts,
                            outcome.duration,
                            &mut states,
                            &mut failures,
                        );
                        if plan.mode == ExecutionMode::Strict && halted_by.is_none() {
                            halted_by = Some(step.id.clone());
                        }
                    }
                }
            }

            // Tasks that panicked never reported an outcome.
            for step_id in spawned {
                let step = steps[step_id.as_str()];
                let error = StepError::Aborted("step task panicked".to_string());
                self.record_failure(plan, step, error, 1, Duration::ZERO, &mut states, &mut failures);
                if plan.mode == ExecutionMode::Strict && halted_by.is_none() {
                    halted_by = Some(step_id);
                }
            }

            observer.group_finished(group_idx + 1, total_groups).await;
        }

        self.cancellation_tokens.remove(&plan.id);
        let elapsed = started.elapsed();
        let result = aggregate(plan, states, failures, elapsed, timed_out);

        if let Some(sink) = &self.progress {
            sink.emit(WorkflowProgressEvent::WorkflowCompleted {
                plan_id: plan.id.clone(),
                status: result.status,
                duration_ms: result.metrics.total_duration_ms,
            });
        }
        tracing::info!(
            plan_id = %plan.id,
            status = %result.status,
            succeeded = result.metrics.success_count,
            failed = result.metrics.failed_count,
            skipped = result.metrics.skipped_count,
            duration_ms = result.metrics.total_duration_ms,
            "workflow execution finished"
        );
        Ok(result)
    }

    /// Mark `step` failed and its pending transitive dependents skipped.
    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        plan: &WorkflowPlan,
        step: &WorkflowStep,
        error: StepError,
        attempts: u32,
        duration: Duration,
        states: &mut HashMap<String, StepState>,
        failures: &mut Vec<(FailedStep, StepError)>,
    ) {
        tracing::warn!(
            plan_id = %plan.id,
            step_id = %step.id,
            attempts,
            error = %error,
            "step failed"
        );
        if let Some(state) = states.get_mut(&step.id) {
            state.status = StepStatus::Failed;
            state.error = Some(error.to_string());
            state.attempts = attempts;
            state.duration = duration;
        }

        let reason = format!("skipped: dependency '{}' failed", step.id);
        let skipped: Vec<String> = dag::transitive_dependents(&step.id, &plan.steps)
            .into_iter()
            .filter(|id| states.get(id).is_some_and(|s| s.status == StepStatus::Pending))
            .collect();
        for id in &skipped {
            mark_skipped(states, id, &reason);
        }

        let impact = if skipped.is_empty() {
            "no dependent steps were affected".to_string()
        } else {
            format!(
                "caused {} dependent step(s) to be skipped: {}",
                skipped.len(),
                skipped.join(", ")
            )
        };
        failures.push((
            FailedStep {
                step_id: step.id.clone(),
                name: step.name.clone(),
                service: step.service,
                error: error.to_string(),
                impact,
                skipped_dependents: skipped,
            },
            error,
        ));
    }
}

impl WorkflowExecutor for DagExecutor {
    async fn execute_workflow(&self, plan: &WorkflowPlan) -> Result<WorkflowResult, ExecutorError> {
        self.run(plan, &NoopObserver).await
    }
}

fn mark_skipped(states: &mut HashMap<String, StepState>, step_id: &str, reason: &str) {
    if let Some(state) = states.get_mut(step_id) {
        state.status = StepStatus::Skipped;
        state.error = Some(reason.to_string());
    }
}

fn skip_remaining(groups: &[Vec<String>], states: &mut HashMap<String, StepState>, reason: &str) {
    for id in groups.iter().flatten() {
        if states.get(id).is_some_and(|s| s.status == StepStatus::Pending) {
            mark_skipped(states, id, reason);
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

fn aggregate(
    plan: &WorkflowPlan,
    mut states: HashMap<String, StepState>,
    failures: Vec<(FailedStep, StepError)>,
    elapsed: Duration,
    timed_out: bool,
) -> WorkflowResult {
    let step_count = plan.steps.len();
    let count = |status: StepStatus| states.values().filter(|s| s.status == status).count();
    let success_count = count(StepStatus::Completed);
    let failed_count = count(StepStatus::Failed);
    let skipped_count = count(StepStatus::Skipped);

    let status = if failed_count == 0 && skipped_count == 0 {
        WorkflowStatus::Completed
    } else {
        match plan.mode {
            ExecutionMode::Strict => WorkflowStatus::Failed,
            ExecutionMode::BestEffort if success_count == 0 => WorkflowStatus::Failed,
            ExecutionMode::BestEffort => WorkflowStatus::Degraded,
        }
    };

    let busy: Duration = states.values().map(|s| s.duration).sum();
    let parallelization_efficiency = if step_count == 0 || elapsed.is_zero() || busy.is_zero() {
        1.0
    } else {
        (busy.as_secs_f64() / elapsed.as_secs_f64()).clamp(f64::EPSILON, step_count as f64)
    };

    let metrics = WorkflowMetrics {
        step_count,
        success_count,
        failed_count,
        skipped_count,
        group_count: plan.parallel_groups.len(),
        total_duration_ms: elapsed.as_millis() as u64,
        parallelization_efficiency,
    };

    let mut artifacts = Vec::new();
    let mut step_results = BTreeMap::new();
    for step in &plan.steps {
        let Some(state) = states.remove(&step.id) else {
            continue;
        };
        if state.status == StepStatus::Completed {
            artifacts.extend(state.artifacts.into_iter().map(|mut a| {
                a.step_id.get_or_insert_with(|| step.id.clone());
                a
            }));
        }
        step_results.insert(
            step.id.clone(),
            StepResult {
                status: state.status,
                data: state.data,
                error: state.error,
                attempts: state.attempts,
                duration_ms: state.duration.as_millis() as u64,
            },
        );
    }

    let summary = summarize(status, &metrics, &failures);
    let suggestions = (status != WorkflowStatus::Completed)
        .then(|| suggest(plan, &failures, timed_out));

    WorkflowResult {
        plan_id: plan.id.clone(),
        success: status != WorkflowStatus::Failed,
        status,
        summary,
        step_results,
        failed_steps: failures.into_iter().map(|(f, _)| f).collect(),
        artifacts,
        metrics,
        suggestions,
    }
}

fn summarize(status: WorkflowStatus, m: &WorkflowMetrics, failures: &[(FailedStep, StepError)]) -> String {
    match status {
        WorkflowStatus::Completed => format!(
            "Workflow completed: all {} steps succeeded in {} ms across {} parallel groups.",
            m.step_count, m.total_duration_ms, m.group_count
        ),
        WorkflowStatus::Degraded | WorkflowStatus::Failed => {
            let label = if status == WorkflowStatus::Failed { "failed" } else { "degraded" };
            let mut summary = format!(
                "Workflow {label}: {} of {} steps succeeded, {} failed, {} skipped.",
                m.success_count, m.step_count, m.failed_count, m.skipped_count
            );
            if let Some((first, _)) = failures.first() {
                summary.push_str(&format!(" First failure: step '{}' ({}).", first.step_id, first.error));
            }
            summary
        }
    }
}

fn suggest(plan: &WorkflowPlan, failures: &[(FailedStep, StepError)], timed_out: bool) -> Vec<String> {
    let mut suggestions: Vec<String> = Vec::new();
    for (failed, error) in failures {
        let suggestion = error.suggestion(&failed.step_id);
        if !suggestions.contains(&suggestion) {
            suggestions.push(suggestion);
        }
    }
    if timed_out {
        suggestions.push(format!(
            "Increase the plan timeout (currently {} ms) or reduce the number of sequential groups.",
            plan.timeout_ms
        ));
    }
    if plan.mode == ExecutionMode::Strict && !failures.is_empty() {
        suggestions.push(
            "Re-run in best-effort mode to let independent branches finish despite failures.".to_string(),
        );
    }
    if suggestions.is_empty() {
        suggestions.push("Review the failed and skipped steps, then re-run the workflow.".to_string());
    }
    suggestions
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::delay::testing::recording_delay;
    use crate::service::{BoxServiceClient, ServiceClient};
    use crate::workflow::dag::compute_parallel_groups;
    use crate::workflow::progress::ProgressBus;
    use nexus_types::workflow::{PlanStatus, Priority};

    /// Scripted behaviour for one operation.
    #[derive(Clone)]
    enum Script {
        Ok(Value),
        OkWithArtifact(Value, &'static str),
        Fail(ServiceErrorKind),
        /// Fail with the given kind `n` times, then succeed with the value.
        Flaky(u32, ServiceErrorKind, Value),
        Sleep(Duration, Value),
        SoftFail,
    }

    /// Test client: behaviour keyed by operation name; records calls.
    struct ScriptedClient {
        service: ServiceId,
        scripts: HashMap<String, Script>,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        failures_left: Arc<Mutex<HashMap<String, u32>>>,
        in_flight: Arc<AtomicU32>,
        max_in_flight: Arc<AtomicU32>,
    }

    impl ScriptedClient {
        fn new(service: ServiceId) -> Self {
            Self {
                service,
                scripts: HashMap::new(),
                calls: Arc::new(Mutex::new(Vec::new())),
                failures_left: Arc::new(Mutex::new(HashMap::new())),
                in_flight: Arc::new(AtomicU32::new(0)),
                max_in_flight: Arc::new(AtomicU32::new(0)),
            }
        }

        fn on(mut self, operation: &str, script: Script) -> Self {
            if let Script::Flaky(n, _, _) = &script {
                self.failures_left.lock().unwrap().insert(operation.to_string(), *n);
            }
            self.scripts.insert(operation.to_string(), script);
            self
        }
    }

    impl ServiceClient for ScriptedClient {
        fn service(&self) -> ServiceId {
            self.service
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            operation: &str,
            input: Value,
            _options: ExecuteOptions,
        ) -> Result<ServiceResponse, ServiceError> {
            self.calls.lock().unwrap().push((operation.to_string(), input));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let script = self.scripts.get(operation).cloned().unwrap_or(Script::Ok(json!({})));
            let result = match script {
                Script::Ok(data) => Ok(ServiceResponse::ok(data)),
                Script::OkWithArtifact(data, name) => {
                    let mut resp = ServiceResponse::ok(data);
                    resp.artifacts.push(Artifact {
                        name: name.to_string(),
                        artifact_type: "report".to_string(),
                        uri: None,
                        data: None,
                        step_id: None,
                    });
                    Ok(resp)
                }
                Script::Fail(kind) => Err(ServiceError::new(self.service, kind, "scripted failure")),
                Script::Flaky(_, kind, data) => {
                    let mut left = self.failures_left.lock().unwrap();
                    let remaining = left.entry(operation.to_string()).or_insert(0);
                    if *remaining > 0 {
                        *remaining -= 1;
                        Err(ServiceError::new(self.service, kind, "transient"))
                    } else {
                        Ok(ServiceResponse::ok(data))
                    }
                }
                Script::Sleep(d, data) => {
                    tokio::time::sleep(d).await;
                    Ok(ServiceResponse::ok(data))
                }
                Script::SoftFail => Ok(ServiceResponse {
                    success: false,
                    data: json!({"error": "quota exceeded"}),
                    artifacts: vec![],
                    metrics: Value::Null,
                }),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn step(id: &str, service: ServiceId, operation: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, service, operation, json!({})).depends_on(deps.iter().copied())
    }

    fn plan(steps: Vec<WorkflowStep>, mode: ExecutionMode) -> WorkflowPlan {
        let parallel_groups = compute_parallel_groups(&steps).unwrap();
        WorkflowPlan {
            id: uuid::Uuid::now_v7().to_string(),
            correlation_id: "corr".to_string(),
            original_request: "test".to_string(),
            steps,
            parallel_groups,
            status: PlanStatus::Planned,
            mode,
            priority: Priority::Normal,
            timeout_ms: 60_000,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tenant_context: None,
        }
    }

    fn executor(clients: Vec<ScriptedClient>) -> (DagExecutor, Arc<Mutex<Vec<Duration>>>) {
        let registry = clients
            .into_iter()
            .fold(ServiceRegistry::new(), |r, c| r.with(BoxServiceClient::new(c)));
        let (delay, seen) = recording_delay();
        (DagExecutor::new(registry, &ExecutorConfig::default()).with_delay(delay), seen)
    }

    #[tokio::test]
    async fn test_diamond_completes_with_references() {
        let files = ScriptedClient::new(ServiceId::Fileprocess)
            .on("extract", Script::OkWithArtifact(json!({"text": "hello", "pages": 2}), "ocr.json"));
        let mage = ScriptedClient::new(ServiceId::Mageagent)
            .on("summarize", Script::Ok(json!({"summary": "hi"})))
            .on("classify", Script::Ok(json!({"label": "memo"})));
        let graph = ScriptedClient::new(ServiceId::Graphrag).on("store", Script::Ok(json!({"stored": true})));
        let mage_calls = Arc::clone(&mage.calls);
        let graph_calls = Arc::clone(&graph.calls);

        let mut summarize = step("step2", ServiceId::Mageagent, "summarize", &["step1"]);
        summarize.input = json!({"content": "${ref:step1.text}", "pages": "${ref:step1.pages}"});
        let mut store = step("step4", ServiceId::Graphrag, "store", &["step2", "step3"]);
        store.input = json!({"doc": "${ref:step2.summary} / ${ref:step3.label}"});
        let plan = plan(
            vec![
                step("step1", ServiceId::Fileprocess, "extract", &[]),
                summarize,
                step("step3", ServiceId::Mageagent, "classify", &["step1"]),
                store,
            ],
            ExecutionMode::Strict,
        );

        let (executor, _) = executor(vec![files, mage, graph]);
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert!(result.success);
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.suggestions.is_none());
        assert!(result.summary.contains("all 4 steps succeeded"));
        assert_eq!(result.metrics.success_count, 4);
        assert_eq!(result.metrics.group_count, 3);
        assert!(result.metrics.parallelization_efficiency > 0.0);
        assert!(result.metrics.parallelization_efficiency <= 4.0);

        let calls = mage_calls.lock().unwrap();
        let (_, summarize_input) = calls.iter().find(|(op, _)| op == "summarize").unwrap();
        assert_eq!(summarize_input, &json!({"content": "hello", "pages": 2}));
        assert_eq!(graph_calls.lock().unwrap()[0].1, json!({"doc": "hi / memo"}));

        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].step_id.as_deref(), Some("step1"));
        assert_eq!(result.step_results["step4"].data, Some(json!({"stored": true})));
    }

    #[tokio::test]
    async fn test_strict_mode_cascade() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox).on("run", Script::Fail(ServiceErrorKind::InvalidInput));
        let mage = ScriptedClient::new(ServiceId::Mageagent);
        let mage_calls = Arc::clone(&mage.calls);
        let plan = plan(
            vec![
                step("step1", ServiceId::Sandbox, "run", &[]),
                step("step2", ServiceId::Mageagent, "explain", &["step1"]),
            ],
            ExecutionMode::Strict,
        );

        let (executor, _) = executor(vec![sandbox, mage]);
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.step_results["step2"].status, StepStatus::Skipped);
        assert_eq!(result.failed_steps.len(), 1);
        assert_eq!(result.failed_steps[0].step_id, "step1");
        assert!(result.failed_steps[0].impact.contains("step2"));
        assert_eq!(result.failed_steps[0].skipped_dependents, vec!["step2"]);
        assert!(result.suggestions.as_ref().is_some_and(|s| !s.is_empty()));
        assert!(mage_calls.lock().unwrap().is_empty());
        // InvalidInput is not retried.
        assert_eq!(result.step_results["step1"].attempts, 1);
    }

    #[tokio::test]
    async fn test_strict_mode_finishes_group_then_halts() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("bad", Script::Fail(ServiceErrorKind::InvalidInput))
            .on("good", Script::Ok(json!({"ok": 1})))
            .on("later", Script::Ok(json!({})));
        let calls = Arc::clone(&sandbox.calls);
        let plan = plan(
            vec![
                step("a", ServiceId::Sandbox, "bad", &[]),
                step("b", ServiceId::Sandbox, "good", &[]),
                step("c", ServiceId::Sandbox, "later", &["b"]),
            ],
            ExecutionMode::Strict,
        );

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert_eq!(result.step_results["b"].status, StepStatus::Completed);
        assert_eq!(result.step_results["c"].status, StepStatus::Skipped);
        assert!(result.step_results["c"].error.as_deref().unwrap().contains("strict mode"));
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!calls.lock().unwrap().iter().any(|(op, _)| op == "later"));
    }

    #[tokio::test]
    async fn test_best_effort_degradation() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("one", Script::Ok(json!(1)))
            .on("two", Script::Fail(ServiceErrorKind::InvalidInput))
            .on("three", Script::Ok(json!(3)));
        let plan = plan(
            vec![
                step("s1", ServiceId::Sandbox, "one", &[]),
                step("s2", ServiceId::Sandbox, "two", &[]),
                step("s3", ServiceId::Sandbox, "three", &[]),
            ],
            ExecutionMode::BestEffort,
        );

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Degraded);
        assert!(result.success);
        assert_eq!(result.metrics.success_count, 2);
        assert_eq!(result.metrics.failed_count, 1);
        assert_eq!(result.metrics.skipped_count, 0);
        assert!(result.suggestions.is_some());
        assert!(result.summary.contains("degraded"));
    }

    #[tokio::test]
    async fn test_best_effort_keeps_independent_branches() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("root-a", Script::Fail(ServiceErrorKind::InvalidInput))
            .on("root-b", Script::Ok(json!({})))
            .on("child-a", Script::Ok(json!({})))
            .on("child-b", Script::Ok(json!({})));
        let plan = plan(
            vec![
                step("a", ServiceId::Sandbox, "root-a", &[]),
                step("b", ServiceId::Sandbox, "root-b", &[]),
                step("a2", ServiceId::Sandbox, "child-a", &["a"]),
                step("b2", ServiceId::Sandbox, "child-b", &["b"]),
                step("join", ServiceId::Sandbox, "child-b", &["a2", "b2"]),
            ],
            ExecutionMode::BestEffort,
        );

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert_eq!(result.step_results["b2"].status, StepStatus::Completed);
        assert_eq!(result.step_results["a2"].status, StepStatus::Skipped);
        assert_eq!(result.step_results["join"].status, StepStatus::Skipped);
        assert_eq!(result.failed_steps[0].skipped_dependents, vec!["a2", "join"]);
        assert_eq!(result.status, WorkflowStatus::Degraded);
    }

    #[tokio::test]
    async fn test_best_effort_all_failed_is_failed() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox).on("x", Script::Fail(ServiceErrorKind::InvalidInput));
        let plan = plan(vec![step("only", ServiceId::Sandbox, "x", &[])], ExecutionMode::BestEffort);
        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!result.summary.is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failures_retry_with_backoff() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("flaky", Script::Flaky(2, ServiceErrorKind::Unavailable, json!({"ok": true})));
        let bus = ProgressBus::new(64);
        let mut rx = bus.subscribe();
        let plan = plan(vec![step("f", ServiceId::Sandbox, "flaky", &[])], ExecutionMode::Strict);

        let (executor, delays) = executor(vec![sandbox]);
        let executor = executor.with_progress(Arc::new(bus));
        let result = executor.execute_workflow(&plan).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step_results["f"].attempts, 3);
        assert_eq!(
            *delays.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_millis(1000)]
        );

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "step_started", "step_failed", "step_progress",
                "step_started", "step_failed", "step_progress",
                "step_started", "step_completed", "workflow_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox).on("down", Script::Fail(ServiceErrorKind::Unavailable));
        let mut s = step("s", ServiceId::Sandbox, "down", &[]);
        s.max_retries = Some(1);
        let plan = plan(vec![s], ExecutionMode::Strict);

        let (executor, delays) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        assert_eq!(result.step_results["s"].status, StepStatus::Failed);
        assert_eq!(result.step_results["s"].attempts, 2);
        assert_eq!(delays.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_failure_response_is_not_retried() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox).on("q", Script::SoftFail);
        let plan = plan(vec![step("s", ServiceId::Sandbox, "q", &[])], ExecutionMode::Strict);
        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        let failed = &result.step_results["s"];
        assert_eq!(failed.attempts, 1);
        assert!(failed.error.as_deref().unwrap().contains("quota exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_step() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("slow", Script::Sleep(Duration::from_secs(60), json!({})));
        let mut s = step("s", ServiceId::Sandbox, "slow", &[]);
        s.timeout_ms = Some(100);
        s.max_retries = Some(0);
        let plan = plan(vec![s], ExecutionMode::Strict);

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        let failed = &result.step_results["s"];
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("timed out"));
        assert!(result.suggestions.unwrap().iter().any(|s| s.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_timeout_skips_unstarted_groups() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("slow", Script::Sleep(Duration::from_secs(2), json!({})))
            .on("next", Script::Ok(json!({})));
        let calls = Arc::clone(&sandbox.calls);
        let mut p = plan(
            vec![
                step("first", ServiceId::Sandbox, "slow", &[]),
                step("second", ServiceId::Sandbox, "next", &["first"]),
            ],
            ExecutionMode::BestEffort,
        );
        p.timeout_ms = 1_000;

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&p).await.unwrap();

        assert_eq!(result.step_results["first"].status, StepStatus::Failed);
        let second = &result.step_results["second"];
        assert_eq!(second.status, StepStatus::Skipped);
        assert!(second.error.as_deref().unwrap().contains("plan timeout"));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(result.suggestions.unwrap().iter().any(|s| s.contains("1000 ms")));
        assert_eq!(result.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails_step_without_call() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox);
        let calls = Arc::clone(&sandbox.calls);
        let mut s = step("s", ServiceId::Sandbox, "run", &[]);
        s.input = json!({"x": "${ref:ghost.value}"});
        let plan = plan(vec![s], ExecutionMode::BestEffort);

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        assert_eq!(result.step_results["s"].status, StepStatus::Failed);
        assert_eq!(result.step_results["s"].attempts, 0);
        assert!(result.failed_steps[0].error.contains("unresolved reference"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_rejected_upfront() {
        let plan = plan(vec![step("s", ServiceId::Graphrag, "store", &[])], ExecutionMode::Strict);
        let (executor, _) = executor(vec![ScriptedClient::new(ServiceId::Sandbox)]);
        let err = executor.execute_workflow(&plan).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingClient { service: ServiceId::Graphrag, .. }));
    }

    #[tokio::test]
    async fn test_inconsistent_groups_rejected() {
        let mut p = plan(vec![step("s", ServiceId::Sandbox, "run", &[])], ExecutionMode::Strict);
        p.parallel_groups = vec![vec!["s".to_string()], vec!["t".to_string()]];
        let (executor, _) = executor(vec![ScriptedClient::new(ServiceId::Sandbox)]);
        assert!(matches!(
            executor.execute_workflow(&p).await,
            Err(ExecutorError::InvalidPlan(_))
        ));
    }

    #[tokio::test]
    async fn test_group_members_run_concurrently() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("wait", Script::Sleep(Duration::from_millis(50), json!({})));
        let max_in_flight = Arc::clone(&sandbox.max_in_flight);
        let plan = plan(
            (0..4).map(|i| step(&format!("s{i}"), ServiceId::Sandbox, "wait", &[])).collect(),
            ExecutionMode::Strict,
        );

        let (executor, _) = executor(vec![sandbox]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 4);
        assert!(result.metrics.parallelization_efficiency > 1.0);
    }

    #[tokio::test]
    async fn test_empty_plan_completes() {
        let plan = plan(vec![], ExecutionMode::Strict);
        let (executor, _) = executor(vec![]);
        let result = executor.execute_workflow(&plan).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!((result.metrics.parallelization_efficiency - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_groups() {
        let sandbox = ScriptedClient::new(ServiceId::Sandbox)
            .on("slow", Script::Sleep(Duration::from_secs(30), json!({})))
            .on("next", Script::Ok(json!({})));
        let plan = plan(
            vec![
                step("first", ServiceId::Sandbox, "slow", &[]),
                step("other", ServiceId::Sandbox, "next", &["first"]),
            ],
            ExecutionMode::BestEffort,
        );
        let (executor, _) = executor(vec![sandbox]);
        let executor = Arc::new(executor);

        let runner = Arc::clone(&executor);
        let run_plan = plan.clone();
        let handle = tokio::spawn(async move { runner.execute_workflow(&run_plan).await });

        while !executor.cancel(&plan.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.step_results["first"].status, StepStatus::Failed);
        assert!(result.step_results["first"].error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(result.step_results["other"].status, StepStatus::Skipped);
        assert!(!executor.cancel(&plan.id));
    }
}
