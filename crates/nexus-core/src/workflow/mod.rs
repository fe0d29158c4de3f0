//! Workflow engine core: planning, reference resolution and DAG execution.
//!
//! - `planning` -- planning collaborator port and its untrusted candidate shape
//! - `planner` -- turns a request into a validated `WorkflowPlan`
//! - `dag` -- dependency graph, cycle detection, parallel group computation
//! - `reference` -- `${ref:stepId.path}` resolution against completed outputs
//! - `retry` -- step failure classification and backoff policy
//! - `progress` -- progress sink port and broadcast bus
//! - `executor` -- wave-based parallel DAG executor
//! - `checkpoint` -- mirrors a run onto a stored task

pub mod checkpoint;
pub mod dag;
pub mod executor;
pub mod planner;
pub mod planning;
pub mod progress;
pub mod reference;
pub mod retry;

pub use checkpoint::TaskCheckpointer;
pub use executor::{DagExecutor, ExecutorError, GroupObserver, WorkflowExecutor};
pub use planner::{PlanOptions, PlannerError, PlanningOutcome, WorkflowPlanner};
pub use planning::{CandidatePlan, CandidateStep, PlanningClient, PlanningClientError, StaticPlanningClient};
pub use progress::{ProgressBus, ProgressSink};
pub use reference::{ResolveError, resolve_references};
pub use retry::{StepError, StepRetryPolicy};
