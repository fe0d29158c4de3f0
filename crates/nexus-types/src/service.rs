//! Service dispatch envelopes.
//!
//! Every backend service is addressed by a closed [`ServiceId`] and answers
//! `execute(operation, input, options)` with a [`ServiceResponse`] or a
//! classified [`ServiceError`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ServiceId
// ---------------------------------------------------------------------------

/// Identifier of a backend service a workflow step can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    /// Document processing (OCR, layout analysis, table extraction).
    Fileprocess,
    /// Security scanning.
    Cyberagent,
    /// Sandboxed code execution.
    Sandbox,
    /// AI analysis (multi-agent LLM orchestration).
    Mageagent,
    /// Knowledge storage and retrieval.
    Graphrag,
}

impl ServiceId {
    pub const ALL: [ServiceId; 5] = [
        ServiceId::Fileprocess,
        ServiceId::Cyberagent,
        ServiceId::Sandbox,
        ServiceId::Mageagent,
        ServiceId::Graphrag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::Fileprocess => "fileprocess",
            ServiceId::Cyberagent => "cyberagent",
            ServiceId::Sandbox => "sandbox",
            ServiceId::Mageagent => "mageagent",
            ServiceId::Graphrag => "graphrag",
        }
    }

    /// One-line description used when rendering planning prompts.
    pub fn description(self) -> &'static str {
        match self {
            ServiceId::Fileprocess => "document processing: OCR, layout and table extraction",
            ServiceId::Cyberagent => "security scanning of files, repositories and URLs",
            ServiceId::Sandbox => "sandboxed code execution",
            ServiceId::Mageagent => "AI analysis, summarization and reasoning",
            ServiceId::Graphrag => "knowledge storage, indexing and retrieval",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = ServiceId::ALL.iter().map(|id| id.as_str()).collect();
                format!("unknown service '{s}' (known: {})", known.join(", "))
            })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A file, report or other durable output produced by a service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Step that produced the artifact; filled in during aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Successful (or soft-failed) reply from a service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metrics: Value,
}

impl ServiceResponse {
    /// Successful response carrying only data.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            artifacts: Vec::new(),
            metrics: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Failure classification for service calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    Timeout,
    Unavailable,
    RateLimited,
    InvalidInput,
    Internal,
}

impl ServiceErrorKind {
    /// Default retry classification for this kind.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ServiceErrorKind::InvalidInput)
    }
}

/// A classified error returned by a service client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{service} {kind:?}: {message}")]
pub struct ServiceError {
    pub service: ServiceId,
    pub kind: ServiceErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ServiceError {
    /// Build an error whose retryability follows its kind.
    pub fn new(service: ServiceId, kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            service,
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }
}
