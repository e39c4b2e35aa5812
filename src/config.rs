//! Configuration management for timewindow.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TimeWindowError};

/// Environment variable prefix, e.g. `TIMEWINDOW_REDIS__URL`.
const ENV_PREFIX: &str = "TIMEWINDOW";

/// Main configuration for a timewindow deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Store connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Sliding window configuration
    #[serde(default)]
    pub window: WindowConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Redis Cluster seed nodes; when non-empty, `url` is ignored
    #[serde(default)]
    pub cluster_nodes: Vec<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            cluster_nodes: Vec::new(),
        }
    }
}

impl RedisConfig {
    pub fn is_cluster(&self) -> bool {
        !self.cluster_nodes.is_empty()
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Sliding window limiter configuration.
///
/// `capacity` events are allowed per rolling `window_secs`; a key that
/// exceeds that rate is blocked for `block_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Events tracked per key before a violation is possible
    #[serde(default)]
    pub capacity: u64,

    /// Rolling window length in seconds
    #[serde(default)]
    pub window_secs: u64,

    /// How long a violating key stays blocked, in seconds
    #[serde(default)]
    pub block_secs: u64,

    /// Namespace prefix for every store key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Wrap logical keys in `{}` so both keys of a check share a cluster slot
    #[serde(default)]
    pub hash_tag: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            window_secs: 0,
            block_secs: 0,
            prefix: default_prefix(),
            hash_tag: false,
        }
    }
}

fn default_prefix() -> String {
    "window".to_string()
}

impl WindowConfig {
    /// Create a configuration with the default key prefix.
    pub fn new(capacity: u64, window: Duration, block: Duration) -> Self {
        Self {
            capacity,
            window_secs: window.as_secs(),
            block_secs: block.as_secs(),
            ..Self::default()
        }
    }

    /// Override the key namespace prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable Redis Cluster hash tags on derived keys.
    pub fn with_hash_tag(mut self, hash_tag: bool) -> Self {
        self.hash_tag = hash_tag;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    /// Check that the configuration describes a usable limiter.
    ///
    /// The store expiry commands only accept whole, positive seconds, so
    /// window and block must both be at least one second.
    pub fn validate(&self) -> Result<()> {
        let max = i64::MAX as u64;
        if self.capacity > max || self.window_secs > max || self.block_secs > max {
            return Err(TimeWindowError::Config(format!(
                "capacity, window_secs and block_secs must not exceed {}",
                max
            )));
        }
        if self.capacity == 0 {
            return Err(TimeWindowError::Config(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(TimeWindowError::Config(
                "window_secs must be at least 1".to_string(),
            ));
        }
        if self.block_secs == 0 {
            return Err(TimeWindowError::Config(
                "block_secs must be at least 1".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(TimeWindowError::Config(
                "prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from defaults, an optional file, then the environment.
    ///
    /// Environment variables use the `TIMEWINDOW_` prefix and `__` between
    /// nested fields, e.g. `TIMEWINDOW_WINDOW__CAPACITY=10`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            if !path.exists() {
                return Err(TimeWindowError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let mut settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.normalize();
        Ok(settings)
    }

    /// Parse settings from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| TimeWindowError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.normalize();
        Ok(settings)
    }

    /// Turn on hash tags for cluster deployments.
    ///
    /// Both keys of one admission check must live in the same cluster slot,
    /// otherwise the store rejects the script with `CROSSSLOT`.
    pub fn normalize(&mut self) {
        if self.redis.is_cluster() && !self.window.hash_tag {
            info!("Redis Cluster configured, enabling key hash tags");
            self.window.hash_tag = true;
        }
    }
}
