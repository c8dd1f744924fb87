//! Engine configuration, loaded from TOML with `VGRAPH_*` overrides.
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 30000
//! max_retries = 2
//! backoff_base_ms = 500
//! commands = ["aws"]
//!
//! [propagation]
//! max_concurrency = 8
//!
//! [events]
//! broadcast_capacity = 256
//! history_capacity = 64
//!
//! [storage]
//! url = "surrealkv://.vgraph/db"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use crate::func::SandboxConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Function invocations run concurrently within one topological level.
    pub max_concurrency: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Live buffer per channel; slower subscribers lag and skip.
    pub broadcast_capacity: usize,
    /// Events replayed by history-retaining channels.
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            history_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SurrealDB URL. Unset means the SurrealDB environment chain decides.
    pub url: Option<String>,
    pub namespace: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox: SandboxConfig,
    pub propagation: PropagationConfig,
    pub events: EventsConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Overlay `VGRAPH_*` environment variables.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Overlay values from `lookup`, keyed by `VGRAPH_*` variable name.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VGRAPH_SANDBOX_TIMEOUT_MS") {
            self.sandbox.timeout_ms = parse_env("VGRAPH_SANDBOX_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("VGRAPH_SANDBOX_MAX_RETRIES") {
            self.sandbox.max_retries = parse_env("VGRAPH_SANDBOX_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("VGRAPH_SANDBOX_BACKOFF_BASE_MS") {
            self.sandbox.backoff_base_ms = parse_env("VGRAPH_SANDBOX_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("VGRAPH_SANDBOX_COMMANDS") {
            self.sandbox.commands = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("VGRAPH_PROPAGATION_MAX_CONCURRENCY") {
            self.propagation.max_concurrency =
                parse_env("VGRAPH_PROPAGATION_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("VGRAPH_EVENTS_HISTORY_CAPACITY") {
            self.events.history_capacity = parse_env("VGRAPH_EVENTS_HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("VGRAPH_STORAGE_URL") {
            self.storage.url = Some(v);
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [sandbox]
            timeout_ms = 5000

            [propagation]
            max_concurrency = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sandbox.timeout_ms, 5000);
        assert_eq!(cfg.sandbox.max_retries, 2);
        assert_eq!(cfg.propagation.max_concurrency, 2);
        assert_eq!(cfg.events, EventsConfig::default());
        assert!(cfg.storage.url.is_none());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("VGRAPH_SANDBOX_MAX_RETRIES", "5"),
            ("VGRAPH_SANDBOX_COMMANDS", "aws, az"),
            ("VGRAPH_STORAGE_URL", "mem://"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.sandbox.max_retries, 5);
        assert_eq!(cfg.sandbox.commands, vec!["aws", "az"]);
        assert_eq!(cfg.storage.url.as_deref(), Some("mem://"));
    }

    #[test]
    fn test_bad_override_rejected() {
        let err = EngineConfig::default()
            .apply_overrides(|k| (k == "VGRAPH_SANDBOX_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
