//! Step-level failure classification and retry policy.
//!
//! A step is retried with exponential backoff (`base * 2^(retry-1)`, capped)
//! up to its `max_retries`. Errors that cannot succeed on a rerun (invalid
//! input, unresolved references, explicit service rejections, cancellation)
//! are never retried.

use std::time::Duration;

use thiserror::Error;

use nexus_types::config::ExecutorConfig;
use nexus_types::service::{ServiceError, ServiceErrorKind, ServiceId};
use nexus_types::workflow::WorkflowStep;

use super::reference::ResolveError;
use crate::delay::exponential_backoff;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a single step failed. Captured into the step's result; never aborts
/// the whole run by itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("unresolved reference: {0}")]
    UnresolvedReference(#[from] ResolveError),

    #[error("step execution failed: {0}")]
    Service(#[from] ServiceError),

    /// The service answered but reported `success: false`.
    #[error("{service} rejected the operation: {message}")]
    Rejected { service: ServiceId, message: String },

    #[error("step timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("step cancelled")]
    Cancelled,

    #[error("step task aborted: {0}")]
    Aborted(String),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Service(e) => e.retryable,
            StepError::Timeout { .. } => true,
            StepError::UnresolvedReference(_)
            | StepError::Rejected { .. }
            | StepError::Cancelled
            | StepError::Aborted(_) => false,
        }
    }

    /// Short, user-facing remedy for this failure.
    pub fn suggestion(&self, step_id: &str) -> String {
        match self {
            StepError::Timeout { .. }
            | StepError::Service(ServiceError {
                kind: ServiceErrorKind::Timeout,
                ..
            }) => format!("Step '{step_id}' timed out; raise its timeout or split the work into smaller steps."),
            StepError::Service(ServiceError {
                kind: ServiceErrorKind::Unavailable | ServiceErrorKind::RateLimited,
                service,
                ..
            }) => format!("Service '{service}' was unavailable or throttled; retry the workflow later."),
            StepError::Service(ServiceError {
                kind: ServiceErrorKind::InvalidInput,
                ..
            })
            | StepError::Rejected { .. } => {
                format!("Step '{step_id}' was rejected; review its operation and input.")
            }
            StepError::Service(ServiceError { service, .. }) => {
                format!("Service '{service}' failed internally on step '{step_id}'; check its logs.")
            }
            StepError::UnresolvedReference(_) => {
                format!("Step '{step_id}' referenced missing output; check its ${{ref:...}} tokens.")
            }
            StepError::Cancelled => {
                "The workflow was cancelled; re-run it to finish the remaining steps.".to_string()
            }
            StepError::Aborted(_) => format!("Step '{step_id}' crashed; re-run the workflow."),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRetryPolicy {
    pub default_max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl StepRetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries,
            base_delay: Duration::from_millis(config.step_retry_base_delay_ms),
            max_delay: Duration::from_millis(config.step_retry_max_delay_ms),
        }
    }

    pub fn max_retries_for(&self, step: &WorkflowStep) -> u32 {
        step.max_retries.unwrap_or(self.default_max_retries)
    }

    /// Whether to run another attempt after `attempt` (1-based) failed.
    pub fn should_retry(&self, error: &StepError, attempt: u32, max_retries: u32) -> bool {
        error.is_retryable() && attempt <= max_retries
    }

    /// Backoff before the retry that follows `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_delay, attempt, Some(self.max_delay))
    }
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_error(kind: ServiceErrorKind) -> StepError {
        StepError::Service(ServiceError::new(ServiceId::Sandbox, kind, "boom"))
    }

    #[test]
    fn test_retry_bounded_by_max_retries() {
        let policy = StepRetryPolicy::default();
        let err = service_error(ServiceErrorKind::Unavailable);
        assert!(policy.should_retry(&err, 1, 2));
        assert!(policy.should_retry(&err, 2, 2));
        assert!(!policy.should_retry(&err, 3, 2));
        assert!(!policy.should_retry(&err, 1, 0));
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = StepRetryPolicy::default();
        assert!(!policy.should_retry(&service_error(ServiceErrorKind::InvalidInput), 1, 5));
        assert!(!policy.should_retry(&StepError::Cancelled, 1, 5));
        let unresolved = StepError::UnresolvedReference(ResolveError::Malformed("x".to_string()));
        assert!(!policy.should_retry(&unresolved, 1, 5));
        assert!(policy.should_retry(&StepError::Timeout { timeout_ms: 10 }, 1, 5));
    }

    #[test]
    fn test_delay_exponential_and_capped() {
        let policy = StepRetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn test_step_override_of_max_retries() {
        let policy = StepRetryPolicy::default();
        let mut step = WorkflowStep::new("s", ServiceId::Sandbox, "run", json!({}));
        assert_eq!(policy.max_retries_for(&step), 2);
        step.max_retries = Some(0);
        assert_eq!(policy.max_retries_for(&step), 0);
    }

    #[test]
    fn test_suggestions_name_step_or_service() {
        assert!(StepError::Timeout { timeout_ms: 5 }.suggestion("scan").contains("'scan'"));
        assert!(service_error(ServiceErrorKind::RateLimited).suggestion("x").contains("sandbox"));
        let unresolved = StepError::UnresolvedReference(ResolveError::Malformed("x".to_string()));
        assert!(unresolved.suggestion("y").contains("${ref:...}"));
    }
}
