//! Workflow domain types.
//!
//! A [`WorkflowPlan`] is a validated DAG of [`WorkflowStep`]s annotated with
//! parallel execution levels. Executing a plan produces exactly one immutable
//! [`WorkflowResult`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::{Artifact, ServiceId};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Status of an individual step.
///
/// `pending -> ready -> running -> {completed | failed | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within a plan.
    pub id: String,
    pub name: String,
    pub service: ServiceId,
    pub operation: String,
    /// Operation input; may contain `${ref:stepId.path}` tokens.
    #[serde(default)]
    pub input: Value,
    /// Step ids this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step-level timeout in milliseconds (service default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt (executor default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl WorkflowStep {
    /// Create a pending step with no dependencies.
    pub fn new(
        id: impl Into<String>,
        service: ServiceId,
        operation: impl Into<String>,
        input: Value,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            service,
            operation: operation.into(),
            input,
            depends_on: Vec::new(),
            timeout_ms: None,
            max_retries: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set dependencies (builder style).
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Failure-tolerance policy for a plan execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Halt after the first group containing a failure.
    #[default]
    Strict,
    /// Skip only the dependents of failed steps and keep going.
    BestEffort,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Strict => f.write_str("strict"),
            ExecutionMode::BestEffort => f.write_str("best-effort"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Overall status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Degraded,
    Failed,
}

/// Tenant scoping propagated to services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A validated workflow plan ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPlan {
    pub id: String,
    pub correlation_id: String,
    pub original_request: String,
    pub steps: Vec<WorkflowStep>,
    /// Minimal leveling of the step DAG: level k only depends on levels < k.
    pub parallel_groups: Vec<Vec<String>>,
    pub status: PlanStatus,
    pub mode: ExecutionMode,
    pub priority: Priority,
    /// Plan-level timeout in milliseconds.
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_context: Option<TenantContext>,
}

impl WorkflowPlan {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Final status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Degraded,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Completed => f.write_str("completed"),
            WorkflowStatus::Degraded => f.write_str("degraded"),
            WorkflowStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Outcome of one step, keyed by step id in [`WorkflowResult::step_results`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made (0 when the step never ran).
    pub attempts: u32,
    pub duration_ms: u64,
}

/// A failed step and the impact of its failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step_id: String,
    pub name: String,
    pub service: ServiceId,
    pub error: String,
    /// Human-readable statement naming the steps skipped because of this failure.
    pub impact: String,
    /// Ids of the steps skipped because of this failure.
    pub skipped_dependents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub step_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub group_count: usize,
    pub total_duration_ms: u64,
    /// Sum of step durations over wall-clock duration, within `(0, step_count]`.
    pub parallelization_efficiency: f64,
}

/// The immutable result of executing one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub plan_id: String,
    pub success: bool,
    pub status: WorkflowStatus,
    pub summary: String,
    pub step_results: BTreeMap<String, StepResult>,
    pub failed_steps: Vec<FailedStep>,
    pub artifacts: Vec<Artifact>,
    pub metrics: WorkflowMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}
