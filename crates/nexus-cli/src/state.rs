//! Application state wiring configuration to concrete adapters.
//!
//! Nothing is global: each command builds the store, registry or executor it
//! needs from the loaded configuration.

use std::path::Path;

use anyhow::Context;

use nexus_core::service::ServiceRegistry;
use nexus_core::store::TaskStore;
use nexus_infra::config::load_config;
use nexus_infra::http::registry_from_config;
use nexus_infra::redis::RedisTaskBackend;
use nexus_types::config::OrchestratorConfig;

/// Task store pinned to the Redis backend.
pub type ConcreteTaskStore = TaskStore<RedisTaskBackend>;

pub struct AppState {
    pub config: OrchestratorConfig,
}

impl AppState {
    /// Load configuration (file, then environment overrides).
    pub async fn init(config_path: &Path) -> Self {
        let config = load_config(config_path).await;
        tracing::debug!(
            path = %config_path.display(),
            services = config.services.len(),
            "configuration loaded"
        );
        Self { config }
    }

    /// Connect to the backing store.
    pub async fn task_store(&self) -> anyhow::Result<ConcreteTaskStore> {
        let backend = RedisTaskBackend::connect(&self.config.store.redis_url)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.store.redis_url))?;
        Ok(TaskStore::new(backend, &self.config.store))
    }

    /// HTTP clients for every configured service.
    pub fn service_registry(&self) -> anyhow::Result<ServiceRegistry> {
        registry_from_config(&self.config.services).context("Invalid [services] configuration")
    }
}
