//! Orchestrator configuration.
//!
//! Settings can be built in code or loaded from a TOML file:
//!
//! ```toml
//! max_time_ms = 5000
//! concurrency = 4
//!
//! [plugins.fullcontact]
//! tier = 1
//! timeout_ms = 800
//!
//! [weights."target.domain"]
//! domain = 0.9
//! badDomain = 0.3
//! ```
//!
//! `LEADER_MAX_TIME_MS` and `LEADER_CONCURRENCY` override the file values.

use crate::conflict::WeightedResolver;
use crate::errors::ConfigurationError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Per-plugin scheduling overrides, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOverride {
    #[serde(default)]
    pub tier: Option<i32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PluginOverride {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Construction-time options for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global wall-clock budget per run in milliseconds
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    /// Maximum plugins in flight per run (unlimited when unset)
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub plugins: HashMap<String, PluginOverride>,
    /// Field key → producer → weight, used to build a weighted resolver
    #[serde(default)]
    pub weights: HashMap<String, HashMap<String, f64>>,
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run deadline. Sub-millisecond remainders round up, so any
    /// non-zero budget stays non-zero.
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        let ms = max_time.as_nanos().div_ceil(1_000_000);
        self.max_time_ms = Some(u64::try_from(ms).unwrap_or(u64::MAX));
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_ms.map(Duration::from_millis)
    }

    /// Overrides for `identity`, matched case-insensitively like registry identities.
    pub fn plugin_override(&self, identity: &str) -> Option<&PluginOverride> {
        self.plugins.get(identity).or_else(|| {
            self.plugins
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(identity))
                .map(|(_, plugin)| plugin)
        })
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse orchestrator config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply `LEADER_*` overrides using `lookup` to read variables.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup("LEADER_MAX_TIME_MS") {
            let ms = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid LEADER_MAX_TIME_MS '{}'", raw))?;
            self.max_time_ms = Some(ms);
        }
        if let Some(raw) = lookup("LEADER_CONCURRENCY") {
            let limit = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid LEADER_CONCURRENCY '{}'", raw))?;
            self.concurrency = Some(limit);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency == Some(0) {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        if self.max_time_ms == Some(0) {
            return Err(ConfigurationError::Invalid(
                "max_time_ms must be greater than 0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (identity, plugin) in &self.plugins {
            if plugin.timeout_ms == Some(0) {
                return Err(ConfigurationError::ZeroTimeout {
                    identity: identity.clone(),
                });
            }
            if !seen.insert(identity.to_ascii_lowercase()) {
                return Err(ConfigurationError::Invalid(format!(
                    "plugin overrides for '{}' are given more than once",
                    identity
                )));
            }
        }
        self.resolver()?;
        Ok(())
    }

    /// Weighted resolver built from `[weights]`, if any are configured.
    pub fn resolver(&self) -> Result<Option<WeightedResolver>, ConfigurationError> {
        if self.weights.is_empty() {
            return Ok(None);
        }
        WeightedResolver::from_table(&self.weights)
            .map(Some)
            .map_err(ConfigurationError::Invalid)
    }
}
