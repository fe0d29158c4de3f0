//! Workflow planner: untrusted candidate steps in, validated plan out.
//!
//! The planner asks a [`PlanningClient`] for candidate steps, validates and
//! normalizes them into a [`WorkflowPlan`] DAG, rejects cycles, computes the
//! parallel groups and estimates the run time.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use nexus_types::config::PlannerConfig;
use nexus_types::service::ServiceId;
use nexus_types::workflow::{
    ExecutionMode, PlanStatus, Priority, StepStatus, TenantContext, WorkflowPlan, WorkflowStep,
};

use super::dag::{self, DagError};
use super::planning::{CandidatePlan, CandidateStep, PlanningClient, PlanningClientError, PlanningPrompt};
use super::reference::referenced_steps;

const PLANNING_TEMPLATE: &str = "\
You decompose a user request into a workflow of service calls.
Available services:
{services}
Answer with JSON: {\"steps\": [{\"id\", \"name\", \"service\", \"operation\", \"input\", \"dependsOn\"}], \
\"confidence\": 0..1, \"clarifications\": [..]}.
Reference another step's output with ${ref:<stepId>.<path>}.";

const GENERIC_CLARIFICATION: &str =
    "The request is ambiguous. Can you describe the expected output and which inputs to use?";

#[derive(Debug, Error)]
pub enum PlannerError {
    /// Malformed steps; every problem found is listed.
    #[error("invalid plan: {}", problems.join("; "))]
    Validation { problems: Vec<String> },

    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error(transparent)]
    Collaborator(#[from] PlanningClientError),
}

impl From<DagError> for PlannerError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected { path } => PlannerError::CycleDetected { path },
            other => PlannerError::Validation {
                problems: vec![other.to_string()],
            },
        }
    }
}

/// Caller-supplied overrides for the produced plan.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Defaults to the configured mode.
    pub mode: Option<ExecutionMode>,
    pub priority: Priority,
    /// Plan-level timeout; defaults to the configured one.
    pub timeout_ms: Option<u64>,
    /// Generated when absent.
    pub correlation_id: Option<String>,
    pub tenant_context: Option<TenantContext>,
}

/// Result of [`WorkflowPlanner::parse_request`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningOutcome {
    pub plan: WorkflowPlan,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarifications: Option<Vec<String>>,
    pub estimated_duration_ms: u64,
    pub involved_services: Vec<ServiceId>,
}

impl PlanningOutcome {
    /// Whether the caller should ask the user before executing.
    pub fn needs_clarification(&self) -> bool {
        self.clarifications.as_ref().is_some_and(|c| !c.is_empty())
    }
}

pub struct WorkflowPlanner<P: PlanningClient> {
    client: P,
    config: PlannerConfig,
    service_timeouts: HashMap<ServiceId, Duration>,
}

impl<P: PlanningClient> WorkflowPlanner<P> {
    pub fn new(client: P, config: PlannerConfig) -> Self {
        Self {
            client,
            config,
            service_timeouts: HashMap::new(),
        }
    }

    /// Per-service default timeouts used when a step sets none.
    pub fn with_service_timeouts(mut self, timeouts: HashMap<ServiceId, Duration>) -> Self {
        self.service_timeouts = timeouts;
        self
    }

    /// Interpret `request` via the collaborator and build a validated plan.
    ///
    /// Low-confidence answers are not rejected: clarifications are surfaced
    /// next to the (possibly empty) plan and the caller decides.
    pub async fn parse_request(
        &self,
        request: &str,
        context: Option<Value>,
        options: PlanOptions,
    ) -> Result<PlanningOutcome, PlannerError> {
        let prompt = PlanningPrompt {
            template: render_template(),
            request: request.to_string(),
            context,
        };
        let candidate = self.client.plan(&prompt).await?;
        self.build(request, candidate, options)
    }

    fn build(
        &self,
        request: &str,
        candidate: CandidatePlan,
        options: PlanOptions,
    ) -> Result<PlanningOutcome, PlannerError> {
        let confidence = if candidate.confidence.is_finite() {
            candidate.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let low_confidence = confidence < self.config.confidence_threshold;

        if candidate.steps.is_empty() && !low_confidence {
            return Err(PlannerError::Validation {
                problems: vec!["plan contains no steps".to_string()],
            });
        }

        let steps = normalize_steps(candidate.steps)?;
        let parallel_groups = dag::compute_parallel_groups(&steps)?;
        check_reference_ordering(&steps)?;

        let estimated_duration_ms = self.estimate_duration_ms(&steps, &parallel_groups);
        let involved_services: Vec<ServiceId> = steps
            .iter()
            .map(|s| s.service)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let clarifications = if low_confidence {
            let mut questions = candidate.clarifications;
            if questions.is_empty() {
                questions.push(GENERIC_CLARIFICATION.to_string());
            }
            Some(questions)
        } else if candidate.clarifications.is_empty() {
            None
        } else {
            Some(candidate.clarifications)
        };

        let plan = WorkflowPlan {
            id: Uuid::now_v7().to_string(),
            correlation_id: options
                .correlation_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            original_request: request.to_string(),
            steps,
            parallel_groups,
            status: PlanStatus::Planned,
            mode: options.mode.unwrap_or(self.config.default_mode),
            priority: options.priority,
            timeout_ms: options.timeout_ms.unwrap_or(self.config.default_plan_timeout_ms),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tenant_context: options.tenant_context,
        };

        if low_confidence {
            tracing::warn!(
                plan_id = %plan.id,
                confidence,
                threshold = self.config.confidence_threshold,
                "planning confidence below threshold, surfacing clarifications"
            );
        }
        tracing::info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            groups = plan.parallel_groups.len(),
            estimated_duration_ms,
            "workflow planned"
        );

        Ok(PlanningOutcome {
            plan,
            confidence,
            clarifications,
            estimated_duration_ms,
            involved_services,
        })
    }

    /// Sum over groups of the slowest step timeout in each group.
    fn estimate_duration_ms(&self, steps: &[WorkflowStep], groups: &[Vec<String>]) -> u64 {
        let by_id: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()))
                    .map(|step| self.step_timeout_ms(step))
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }

    fn step_timeout_ms(&self, step: &WorkflowStep) -> u64 {
        step.timeout_ms.unwrap_or_else(|| {
            self.service_timeouts
                .get(&step.service)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(self.config.default_step_timeout_ms)
        })
    }
}

fn render_template() -> String {
    let services: Vec<String> = ServiceId::ALL
        .iter()
        .map(|id| format!("- {id}: {}", id.description()))
        .collect();
    PLANNING_TEMPLATE.replace("{services}", &services.join("\n"))
}

/// Validate candidate steps and turn them into pending workflow steps.
///
/// Collects every problem before failing. Steps without an id get
/// `step-<position>` (1-based), skipping ids already taken. Ids may not
/// contain `.` or `}` since references could not address them.
fn normalize_steps(candidates: Vec<CandidateStep>) -> Result<Vec<WorkflowStep>, PlannerError> {
    let mut problems = Vec::new();

    let mut taken: HashSet<String> = HashSet::new();
    for candidate in &candidates {
        if let Some(id) = candidate.id.as_deref().filter(|id| !id.trim().is_empty()) {
            if id.contains(['.', '}']) {
                problems.push(format!("step id '{id}' must not contain '.' or '}}'"));
            }
            if !taken.insert(id.to_string()) {
                problems.push(format!("duplicate step id '{id}'"));
            }
        }
    }

    let mut ids = Vec::with_capacity(candidates.len());
    for (position, candidate) in candidates.iter().enumerate() {
        match candidate.id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(id) => ids.push(id.to_string()),
            None => {
                let mut n = position + 1;
                let mut generated = format!("step-{n}");
                while taken.contains(&generated) {
                    n += 1;
                    generated = format!("step-{n}");
                }
                taken.insert(generated.clone());
                ids.push(generated);
            }
        }
    }

    let mut steps = Vec::with_capacity(candidates.len());
    for (candidate, id) in candidates.into_iter().zip(ids) {
        let service = match candidate.service.as_deref() {
            None => {
                problems.push(format!("step '{id}' is missing 'service'"));
                None
            }
            Some(raw) => match raw.parse::<ServiceId>() {
                Ok(service) => Some(service),
                Err(e) => {
                    problems.push(format!("step '{id}': {e}"));
                    None
                }
            },
        };
        let operation = candidate.operation.filter(|op| !op.trim().is_empty());
        if operation.is_none() {
            problems.push(format!("step '{id}' is missing 'operation'"));
        }

        let depends_on = candidate.depends_on.unwrap_or_default();
        for dep in &depends_on {
            if dep == &id {
                problems.push(format!("step '{id}' depends on itself"));
            } else if !taken.contains(dep) {
                problems.push(format!("step '{id}' depends on unknown step '{dep}'"));
            }
        }

        let input = candidate.input.unwrap_or_else(|| Value::Object(Default::default()));
        match referenced_steps(&input) {
            Ok(refs) => {
                for referenced in refs.iter().filter(|r| !taken.contains(*r)) {
                    problems.push(format!("step '{id}' references unknown step '{referenced}'"));
                }
            }
            Err(e) => problems.push(format!("step '{id}': {e}")),
        }

        if let (Some(service), Some(operation)) = (service, operation) {
            steps.push(WorkflowStep {
                name: candidate.name.unwrap_or_else(|| id.clone()),
                id,
                service,
                operation,
                input,
                depends_on,
                timeout_ms: candidate.timeout_ms,
                max_retries: candidate.max_retries,
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            });
        }
    }

    if problems.is_empty() {
        Ok(steps)
    } else {
        Err(PlannerError::Validation { problems })
    }
}

/// A step may only reference steps it (transitively) depends on, otherwise
/// the referenced output is not guaranteed to exist when it runs.
fn check_reference_ordering(steps: &[WorkflowStep]) -> Result<(), PlannerError> {
    let mut problems = Vec::new();
    for step in steps {
        let refs = referenced_steps(&step.input).unwrap_or_default();
        for referenced in refs {
            if referenced == step.id {
                problems.push(format!("step '{}' references its own output", step.id));
            } else if !dag::transitive_dependents(&referenced, steps).contains(&step.id) {
                problems.push(format!(
                    "step '{}' references step '{referenced}' without depending on it",
                    step.id
                ));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(PlannerError::Validation { problems })
    }
}
