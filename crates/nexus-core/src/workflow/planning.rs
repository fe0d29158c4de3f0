//! Planning collaborator port.
//!
//! Turning a natural-language request into steps is delegated to an external
//! collaborator (typically an LLM). Its answer is untrusted: every field of a
//! [`CandidatePlan`] is optional and the planner validates all of it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What the planner sends to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanningPrompt {
    /// Rendered instructions, including the list of known services.
    pub template: String,
    pub request: String,
    /// Prior context supplied by the caller (e.g. earlier results).
    pub context: Option<Value>,
}

/// One untrusted step as returned by the collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateStep {
    pub id: Option<String>,
    pub name: Option<String>,
    pub service: Option<String>,
    pub operation: Option<String>,
    pub input: Option<Value>,
    pub depends_on: Option<Vec<String>>,
    #[serde(alias = "timeout")]
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// The collaborator's full answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidatePlan {
    pub steps: Vec<CandidateStep>,
    pub confidence: f64,
    pub clarifications: Vec<String>,
}

/// The collaborator could not be reached or returned garbage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("planning collaborator failed: {0}")]
pub struct PlanningClientError(pub String);

/// Trait for planning collaborators.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait PlanningClient: Send + Sync {
    fn plan(
        &self,
        prompt: &PlanningPrompt,
    ) -> impl std::future::Future<Output = Result<CandidatePlan, PlanningClientError>> + Send;
}

/// A collaborator that always answers with the same candidate.
///
/// Used to plan from a hand-written candidate file and in tests.
#[derive(Debug, Clone)]
pub struct StaticPlanningClient {
    candidate: CandidatePlan,
}

impl StaticPlanningClient {
    pub fn new(candidate: CandidatePlan) -> Self {
        Self { candidate }
    }
}

impl PlanningClient for StaticPlanningClient {
    async fn plan(&self, _prompt: &PlanningPrompt) -> Result<CandidatePlan, PlanningClientError> {
        Ok(self.candidate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_tolerates_missing_fields() {
        let plan: CandidatePlan = serde_json::from_value(json!({
            "steps": [{"service": "graphrag"}, {"id": "x", "timeout": 500, "dependsOn": ["a"]}]
        }))
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].id.is_none());
        assert_eq!(plan.steps[1].timeout_ms, Some(500));
        assert_eq!(plan.steps[1].depends_on.as_deref(), Some(&["a".to_string()][..]));
        assert_eq!(plan.confidence, 0.0);
        assert!(plan.clarifications.is_empty());
    }

    #[tokio::test]
    async fn test_static_client_returns_candidate() {
        let candidate = CandidatePlan {
            steps: vec![CandidateStep::default()],
            confidence: 0.9,
            clarifications: vec![],
        };
        let client = StaticPlanningClient::new(candidate.clone());
        let prompt = PlanningPrompt {
            template: String::new(),
            request: "anything".to_string(),
            context: None,
        };
        assert_eq!(client.plan(&prompt).await.unwrap(), candidate);
    }
}
