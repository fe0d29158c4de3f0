//! ServiceClient trait definition.
//!
//! Every backend service (document processing, security scanning, sandboxed
//! execution, AI analysis, knowledge storage) is reached through the same
//! `execute(operation, input, options)` contract. The executor is agnostic to
//! client internals.

use std::time::Duration;

use serde_json::Value;

use nexus_types::service::{ServiceError, ServiceId, ServiceResponse};
use nexus_types::workflow::TenantContext;

/// Per-call options passed to [`ServiceClient::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Deadline for this call. The executor also enforces it externally.
    pub timeout: Duration,
    pub correlation_id: Option<String>,
    pub tenant: Option<TenantContext>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            correlation_id: None,
            tenant: None,
        }
    }
}

/// Trait for backend service clients.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
/// Implementations live in nexus-infra (e.g., `HttpServiceClient`).
pub trait ServiceClient: Send + Sync {
    /// Which service this client talks to.
    fn service(&self) -> ServiceId;

    /// Timeout applied to steps that do not set their own.
    fn default_timeout(&self) -> Duration;

    /// Run `operation` with an already-resolved `input`.
    fn execute(
        &self,
        operation: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> impl std::future::Future<Output = Result<ServiceResponse, ServiceError>> + Send;
}
