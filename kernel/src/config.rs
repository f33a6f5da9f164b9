// Node Configuration
//
// Per-node settings loaded from JSON. Every field has a default, and a
// few timing knobs can be overridden from the environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::service::methods;

pub const CONSISTENCY_TIMEOUT_ENV: &str = "WARDEN_CONSISTENCY_TIMEOUT_MS";
pub const SIDE_EFFECT_TIMEOUT_ENV: &str = "WARDEN_SIDE_EFFECT_TIMEOUT_MS";
pub const SNAPSHOT_INTERVAL_ENV: &str = "WARDEN_SNAPSHOT_INTERVAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Admin,
    Resource,
}

/// Where obligation responses run relative to the triggering request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EppMode {
    /// Inline; resource callers wait for the side effects to replicate.
    Sync,
    /// On a background worker; callers never wait.
    Async,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Admin snapshots when `revision % snapshot_interval == 0`; `0` disables.
    pub snapshot_interval: u64,
    pub consistency_timeout_ms: u64,
    pub side_effect_timeout_ms: u64,
    pub consumer_group: String,
    pub bootstrap_path: Option<PathBuf>,
    pub shutdown_after_bootstrap: bool,
    pub epp_mode: EppMode,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Methods the consistency gate never blocks.
    pub gate_exclusions: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Admin,
            snapshot_interval: 1000,
            consistency_timeout_ms: 5000,
            side_effect_timeout_ms: 5000,
            consumer_group: "warden-admin".into(),
            bootstrap_path: None,
            shutdown_after_bootstrap: false,
            epp_mode: EppMode::Sync,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            gate_exclusions: [
                methods::PROCESS_EVENT,
                methods::ADJUDICATE_OPERATION,
                methods::ADJUDICATE_ROUTINE,
                methods::HEALTH,
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{name}={value} is not a non-negative integer")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Load from a JSON file, then apply environment overrides and validate.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: NodeConfig = serde_json::from_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv { name, value })
                })
                .transpose()
        };

        if let Some(ms) = read(CONSISTENCY_TIMEOUT_ENV)? {
            self.consistency_timeout_ms = ms;
        }
        if let Some(ms) = read(SIDE_EFFECT_TIMEOUT_ENV)? {
            self.side_effect_timeout_ms = ms;
        }
        if let Some(interval) = read(SNAPSHOT_INTERVAL_ENV)? {
            self.snapshot_interval = interval;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid("backoff_base_ms must be positive".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "backoff_base_ms exceeds backoff_max_ms".into(),
            ));
        }
        if self.consistency_timeout_ms == 0 || self.side_effect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.consumer_group.is_empty() {
            return Err(ConfigError::Invalid("consumer_group is empty".into()));
        }
        Ok(())
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_millis(self.consistency_timeout_ms)
    }

    pub fn side_effect_timeout(&self) -> Duration {
        Duration::from_millis(self.side_effect_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
