//! Progress events emitted while a workflow plan executes.
//!
//! `WorkflowProgressEvent` is purely observational. All variants are
//! Clone + Send + Sync so they can travel over tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::service::ServiceId;
use crate::workflow::WorkflowStatus;

/// A single transition reported to a progress sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowProgressEvent {
    /// A step has been dispatched to its service.
    StepStarted {
        plan_id: String,
        step_id: String,
        service: ServiceId,
        operation: String,
        /// 1-based attempt number.
        attempt: u32,
    },

    /// A step attempt failed and will be retried after `delay_ms`.
    StepProgress {
        plan_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        message: String,
    },

    /// A step completed successfully.
    StepCompleted {
        plan_id: String,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        plan_id: String,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// The whole plan has finished executing.
    WorkflowCompleted {
        plan_id: String,
        status: WorkflowStatus,
        duration_ms: u64,
    },
}

impl WorkflowProgressEvent {
    pub fn plan_id(&self) -> &str {
        match self {
            WorkflowProgressEvent::StepStarted { plan_id, .. }
            | WorkflowProgressEvent::StepProgress { plan_id, .. }
            | WorkflowProgressEvent::StepCompleted { plan_id, .. }
            | WorkflowProgressEvent::StepFailed { plan_id, .. }
            | WorkflowProgressEvent::WorkflowCompleted { plan_id, .. } => plan_id,
        }
    }

    /// Step id for step-scoped events, `None` for plan-scoped ones.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowProgressEvent::StepStarted { step_id, .. }
            | WorkflowProgressEvent::StepProgress { step_id, .. }
            | WorkflowProgressEvent::StepCompleted { step_id, .. }
            | WorkflowProgressEvent::StepFailed { step_id, .. } => Some(step_id),
            WorkflowProgressEvent::WorkflowCompleted { .. } => None,
        }
    }
}
