//! Configuration loader for Nexus.
//!
//! Reads a TOML file and deserializes it into [`OrchestratorConfig`]. Falls
//! back to defaults when the file is missing or malformed, then applies
//! environment overrides.

use std::path::Path;

use nexus_types::config::OrchestratorConfig;

/// Backing store URL override.
pub const ENV_REDIS_URL: &str = "REDIS_URL";
/// Key prefix override.
pub const ENV_KEY_PREFIX: &str = "NEXUS_KEY_PREFIX";
/// Task TTL override, in seconds.
pub const ENV_TASK_TTL_SECS: &str = "NEXUS_TASK_TTL_SECS";

/// Load configuration from `path`, then apply environment overrides.
///
/// - If the file does not exist, starts from [`OrchestratorConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and starts from the default.
/// - Otherwise starts from the parsed config.
pub async fn load_config(path: &Path) -> OrchestratorConfig {
    let config = read_config_file(path).await;
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

async fn read_config_file(path: &Path) -> OrchestratorConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return OrchestratorConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return OrchestratorConfig::default();
        }
    };

    match toml::from_str::<OrchestratorConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            OrchestratorConfig::default()
        }
    }
}

/// Apply overrides read through `lookup` (the process environment in production).
///
/// Unparseable numeric values are ignored with a warning.
pub fn apply_env_overrides(
    mut config: OrchestratorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> OrchestratorConfig {
    if let Some(url) = lookup(ENV_REDIS_URL).filter(|v| !v.is_empty()) {
        config.store.redis_url = url;
    }
    if let Some(prefix) = lookup(ENV_KEY_PREFIX).filter(|v| !v.is_empty()) {
        config.store.key_prefix = prefix;
    }
    if let Some(raw) = lookup(ENV_TASK_TTL_SECS) {
        match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => config.store.ttl_secs = secs,
            _ => tracing::warn!(value = %raw, "ignoring invalid {ENV_TASK_TTL_SECS}"),
        }
    }
    config
}
