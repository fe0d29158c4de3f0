//! BoxServiceClient -- object-safe dynamic dispatch wrapper for ServiceClient.
//!
//! 1. Define an object-safe `ServiceClientDyn` trait with boxed futures
//! 2. Blanket-impl `ServiceClientDyn` for all `T: ServiceClient`
//! 3. `BoxServiceClient` wraps `Box<dyn ServiceClientDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use nexus_types::service::{ServiceError, ServiceId, ServiceResponse};

use super::client::{ExecuteOptions, ServiceClient};

/// Object-safe version of [`ServiceClient`] with boxed futures.
pub trait ServiceClientDyn: Send + Sync {
    fn service(&self) -> ServiceId;

    fn default_timeout(&self) -> Duration;

    fn execute_boxed<'a>(
        &'a self,
        operation: &'a str,
        input: Value,
        options: ExecuteOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceResponse, ServiceError>> + Send + 'a>>;
}

impl<T: ServiceClient> ServiceClientDyn for T {
    fn service(&self) -> ServiceId {
        ServiceClient::service(self)
    }

    fn default_timeout(&self) -> Duration {
        ServiceClient::default_timeout(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        operation: &'a str,
        input: Value,
        options: ExecuteOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceResponse, ServiceError>> + Send + 'a>> {
        Box::pin(self.execute(operation, input, options))
    }
}

/// Type-erased service client, so one registry can hold clients of
/// different concrete types (HTTP, in-process, test doubles).
pub struct BoxServiceClient {
    inner: Box<dyn ServiceClientDyn>,
}

impl BoxServiceClient {
    pub fn new<T: ServiceClient + 'static>(client: T) -> Self {
        Self {
            inner: Box::new(client),
        }
    }

    pub fn service(&self) -> ServiceId {
        self.inner.service()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout()
    }

    pub async fn execute(
        &self,
        operation: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<ServiceResponse, ServiceError> {
        self.inner.execute_boxed(operation, input, options).await
    }
}
