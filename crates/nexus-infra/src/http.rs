//! HttpServiceClient -- concrete [`ServiceClient`] over HTTP/JSON.
//!
//! Every backend service exposes `POST {base_url}/api/operations/{operation}`
//! taking the resolved step input as the JSON body and answering with a
//! [`ServiceResponse`]. Transport failures and non-2xx statuses are
//! classified into [`ServiceError`] kinds so the executor can decide whether
//! to retry.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use nexus_core::service::{BoxServiceClient, ExecuteOptions, ServiceClient, ServiceRegistry};
use nexus_types::config::ServiceEndpoint;
use nexus_types::service::{ServiceError, ServiceErrorKind, ServiceId, ServiceResponse};

/// Header carrying the plan's correlation id.
const CORRELATION_HEADER: &str = "x-correlation-id";
/// Header carrying the tenant id, when the plan has one.
const TENANT_HEADER: &str = "x-tenant-id";

/// Errors building the HTTP client set from configuration.
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("{0}")]
    UnknownService(String),

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// HTTP client for one backend service.
pub struct HttpServiceClient {
    client: reqwest::Client,
    service: ServiceId,
    base_url: String,
    default_timeout: Duration,
}

impl HttpServiceClient {
    pub fn new(service: ServiceId, endpoint: &ServiceEndpoint) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            service,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            default_timeout: Duration::from_millis(endpoint.timeout_ms),
        })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/api/operations/{operation}", self.base_url)
    }

    fn error(&self, kind: ServiceErrorKind, message: impl Into<String>) -> ServiceError {
        ServiceError::new(self.service, kind, message)
    }
}

/// Map a non-success status to an error kind.
fn classify_status(status: StatusCode) -> ServiceErrorKind {
    match status.as_u16() {
        408 | 504 => ServiceErrorKind::Timeout,
        429 => ServiceErrorKind::RateLimited,
        500..=599 => ServiceErrorKind::Unavailable,
        _ => ServiceErrorKind::InvalidInput,
    }
}

impl ServiceClient for HttpServiceClient {
    fn service(&self) -> ServiceId {
        self.service
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    async fn execute(
        &self,
        operation: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<ServiceResponse, ServiceError> {
        let mut request = self
            .client
            .post(self.url(operation))
            .timeout(options.timeout)
            .json(&input);
        if let Some(correlation_id) = &options.correlation_id {
            request = request.header(CORRELATION_HEADER, correlation_id);
        }
        if let Some(tenant) = &options.tenant {
            request = request.header(TENANT_HEADER, &tenant.tenant_id);
        }

        tracing::debug!(service = %self.service, operation, "dispatching service call");

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ServiceErrorKind::Timeout
            } else {
                ServiceErrorKind::Unavailable
            };
            self.error(kind, format!("HTTP request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error(classify_status(status), format!("HTTP {status}: {body}")));
        }

        response
            .json::<ServiceResponse>()
            .await
            .map_err(|e| self.error(ServiceErrorKind::Internal, format!("failed to parse response: {e}")))
    }
}

/// Build a registry holding one HTTP client per configured service.
///
/// Keys of `services` must be known service identifiers.
pub fn registry_from_config<'a>(
    services: impl IntoIterator<Item = (&'a String, &'a ServiceEndpoint)>,
) -> Result<ServiceRegistry, HttpClientError> {
    let mut registry = ServiceRegistry::new();
    for (name, endpoint) in services {
        let service: ServiceId = name.parse().map_err(HttpClientError::UnknownService)?;
        registry.register(BoxServiceClient::new(HttpServiceClient::new(service, endpoint)?));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn endpoint(base_url: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            base_url: base_url.to_string(),
            timeout_ms: 2_000,
        }
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let client = HttpServiceClient::new(ServiceId::Graphrag, &endpoint("http://graph:8090/")).unwrap();
        assert_eq!(client.url("store"), "http://graph:8090/api/operations/store");
        assert_eq!(ServiceClient::default_timeout(&client), Duration::from_secs(2));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), ServiceErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), ServiceErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ServiceErrorKind::RateLimited);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), ServiceErrorKind::Unavailable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ServiceErrorKind::InvalidInput);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ServiceErrorKind::InvalidInput);
    }

    #[test]
    fn test_registry_from_config() {
        let mut services = BTreeMap::new();
        services.insert("sandbox".to_string(), endpoint("http://sandbox:8080"));
        services.insert("graphrag".to_string(), endpoint("http://graph:8090"));
        let registry = registry_from_config(&services).unwrap();
        assert_eq!(registry.services(), vec![ServiceId::Sandbox, ServiceId::Graphrag]);
    }

    #[test]
    fn test_registry_rejects_unknown_service() {
        let mut services = BTreeMap::new();
        services.insert("mailer".to_string(), endpoint("http://mail"));
        let err = registry_from_config(&services).unwrap_err();
        assert!(err.to_string().contains("mailer"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let client = HttpServiceClient::new(ServiceId::Sandbox, &endpoint("http://127.0.0.1:9")).unwrap();
        let err = client
            .execute("run", json!({}), ExecuteOptions::with_timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.service, ServiceId::Sandbox);
        assert!(err.retryable);
    }
}
