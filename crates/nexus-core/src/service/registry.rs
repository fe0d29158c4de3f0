//! Service registry for dispatch by [`ServiceId`].

use std::collections::HashMap;
use std::time::Duration;

use nexus_types::service::ServiceId;

use super::box_client::BoxServiceClient;

/// Registry of service clients, indexed by the closed [`ServiceId`] set.
pub struct ServiceRegistry {
    clients: HashMap<ServiceId, BoxServiceClient>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a client under the service it reports.
    ///
    /// An existing client for the same service is replaced.
    pub fn register(&mut self, client: BoxServiceClient) {
        self.clients.insert(client.service(), client);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, client: BoxServiceClient) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, service: ServiceId) -> Option<&BoxServiceClient> {
        self.clients.get(&service)
    }

    pub fn contains(&self, service: ServiceId) -> bool {
        self.clients.contains_key(&service)
    }

    pub fn default_timeout(&self, service: ServiceId) -> Option<Duration> {
        self.clients.get(&service).map(BoxServiceClient::default_timeout)
    }

    /// Registered services in `ServiceId` order.
    pub fn services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services())
            .finish_non_exhaustive()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
