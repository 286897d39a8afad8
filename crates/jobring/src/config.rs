//! TOML configuration for the `jobring` tool.
//!
//! Every field has a default, so an empty or missing file is valid.

use std::path::Path;
use std::time::Duration;

use jobring_cluster::config::{DEFAULT_HASH_REPLICAS, DEFAULT_REFRESH_INTERVAL};
use jobring_cluster::registry::DEFAULT_STALE_AFTER;
use jobring_cluster::{MembershipComparison, PoolConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node pool settings.
    pub pool: PoolSection,
    /// Shared registry settings (used by `simulate`).
    pub registry: RegistrySection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[pool]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Logical group shared by all cooperating processes.
    pub service_name: String,
    /// Period between membership refreshes, in milliseconds.
    pub refresh_interval_ms: u64,
    /// Virtual nodes per member.
    pub hash_replicas: usize,
    /// `"ordered"` or `"unordered"` membership comparison.
    pub comparison: MembershipComparison,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
            hash_replicas: DEFAULT_HASH_REPLICAS,
            comparison: MembershipComparison::default(),
        }
    }
}

/// `[registry]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Heartbeat age after which a node is dropped, in milliseconds.
    pub stale_after_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER.as_millis() as u64,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective refresh interval (never zero).
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.pool.refresh_interval_ms.max(1))
    }

    /// Effective registry stale threshold (never zero).
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.registry.stale_after_ms.max(1))
    }

    /// Build the library-level pool configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.pool.service_name.clone())
            .with_refresh_interval(self.refresh_interval())
            .with_hash_replicas(self.pool.hash_replicas)
            .with_comparison(self.pool.comparison)
    }
}
