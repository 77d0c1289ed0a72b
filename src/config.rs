//! Configuration management for Turnstile.
//!
//! Settings come from an optional YAML file layered under environment
//! variables prefixed with `TURNSTILE_` (sections separated by `__`, e.g.
//! `TURNSTILE_LIMITS__MAX_REQUESTS=20`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global rate limit defaults
    #[serde(default)]
    pub limits: LimitDefaults,

    /// Counter store configuration
    #[serde(default)]
    pub counter_store: CounterStoreConfig,

    /// Per-identity override table configuration
    #[serde(default)]
    pub overrides: OverridesConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Process-wide limit parameters applied when no override supplies a value.
///
/// Loaded once at start and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefaults {
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            block_time_secs: default_block_time_secs(),
        }
    }
}

impl LimitDefaults {
    /// Create a new set of defaults.
    pub fn new(max_requests: u64, block_time_secs: u64) -> Self {
        Self {
            max_requests,
            block_time_secs,
        }
    }

    /// Window length as a duration.
    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.block_time_secs)
    }
}

fn default_max_requests() -> u64 {
    10
}

fn default_block_time_secs() -> u64 {
    60
}

/// Which counter store implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// In-process expiring map
    #[default]
    Memory,
    /// Redis `GET`/`SET EX`
    Redis,
}

/// How the decision engine talks to the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    /// Separate read and write calls. Concurrent requests for the same
    /// identity may both be admitted at the boundary.
    #[default]
    GetSet,
    /// Single check-and-increment call. Never admits more than the cap.
    Atomic,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterStoreConfig {
    #[serde(default)]
    pub backend: CounterBackend,

    #[serde(default)]
    pub mode: CounterMode,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-call timeout owned by the store client, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend drops expired counters, in seconds
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            mode: CounterMode::default(),
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl CounterStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_purge_interval_secs() -> u64 {
    60
}

/// Override table configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverridesConfig {
    /// YAML file the override table is seeded from and written back to
    #[serde(default)]
    pub path: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// A missing file is not an error; the environment and defaults still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading service configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ServiceConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_requests == 0 {
            return Err(TurnstileError::Config(
                "limits.max_requests must be greater than zero".to_string(),
            ));
        }
        if self.limits.block_time_secs == 0 {
            return Err(TurnstileError::Config(
                "limits.block_time_secs must be greater than zero".to_string(),
            ));
        }
        if self.counter_store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "counter_store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.counter_store.purge_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "counter_store.purge_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.counter_store.backend == CounterBackend::Redis
            && self.counter_store.redis_url.is_none()
        {
            return Err(TurnstileError::Config(
                "counter_store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
