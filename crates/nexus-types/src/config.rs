//! Configuration types for the orchestrator.
//!
//! `OrchestratorConfig` represents the `nexus.toml` file. Every field has a
//! default so an empty (or missing) file yields a working local setup.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::workflow::ExecutionMode;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Service endpoints keyed by service identifier (e.g. `"mageagent"`).
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEndpoint>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Task store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key the store writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Retention window applied to task records and indices.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Optimistic-lock retries after the first rejected commit.
    #[serde(default = "default_store_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "nexus".to_string()
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_store_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    50
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            max_retries: default_store_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Below this confidence, clarifications are surfaced to the caller.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_plan_timeout_ms")]
    pub default_plan_timeout_ms: u64,

    /// Used for steps without a timeout when no service default applies.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    #[serde(default)]
    pub default_mode: ExecutionMode,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_plan_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_step_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            default_plan_timeout_ms: default_plan_timeout_ms(),
            default_step_timeout_ms: default_step_timeout_ms(),
            default_mode: ExecutionMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Step retries when the step does not set `maxRetries`.
    #[serde(default = "default_step_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_step_retry_base_delay_ms")]
    pub step_retry_base_delay_ms: u64,

    #[serde(default = "default_step_retry_max_delay_ms")]
    pub step_retry_max_delay_ms: u64,

    /// Buffer size of the progress broadcast channel.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

fn default_step_max_retries() -> u32 {
    2
}

fn default_step_retry_base_delay_ms() -> u64 {
    500
}

fn default_step_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_progress_capacity() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_step_max_retries(),
            step_retry_base_delay_ms: default_step_retry_base_delay_ms(),
            step_retry_max_delay_ms: default_step_retry_max_delay_ms(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// How to reach one backend service over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub base_url: String,

    /// Default per-call timeout for this service.
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_service_timeout_ms() -> u64 {
    120_000
}
