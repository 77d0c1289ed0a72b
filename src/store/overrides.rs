//! Per-identity rate limit overrides and their in-process table.
//!
//! The table can be seeded from a YAML file holding a list of overrides and
//! written back to it after every mutation:
//!
//! ```yaml
//! - id: 1
//!   config_value: goExpert
//!   limit_type: API_KEY
//!   max_request: 100
//!   block_time: 60
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info};

use super::{ConfigStore, StoreError};

/// Classification of an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    ApiKey,
    Ip,
    #[default]
    Global,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::ApiKey => "API_KEY",
            LimitType::Ip => "IP",
            LimitType::Global => "GLOBAL",
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API_KEY" => Ok(LimitType::ApiKey),
            "IP" => Ok(LimitType::Ip),
            "GLOBAL" | "" => Ok(LimitType::Global),
            other => Err(format!("unknown limit type {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for LimitType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => raw.parse().map_err(serde::de::Error::custom),
            None => Ok(LimitType::Global),
        }
    }
}

/// A persisted per-identity override of the global limit parameters.
///
/// A zero `max_request` or `block_time` means "not overridden".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Assigned by the store on creation, never changed afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The API key or IP address this override applies to
    pub config_value: String,
    #[serde(default)]
    pub limit_type: LimitType,
    /// Requests per window, 0 for the global default
    #[serde(default)]
    pub max_request: u64,
    /// Window length in seconds, 0 for the global default
    #[serde(default)]
    pub block_time: u64,
}

impl RateLimitConfig {
    /// An override for `config_value` with every limit left at the default.
    pub fn new(config_value: impl Into<String>) -> Self {
        Self {
            id: None,
            config_value: config_value.into(),
            limit_type: LimitType::Global,
            max_request: 0,
            block_time: 0,
        }
    }

    pub fn with_limit_type(mut self, limit_type: LimitType) -> Self {
        self.limit_type = limit_type;
        self
    }

    pub fn with_max_request(mut self, max_request: u64) -> Self {
        self.max_request = max_request;
        self
    }

    pub fn with_block_time(mut self, block_time: u64) -> Self {
        self.block_time = block_time;
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    rows: BTreeMap<u64, RateLimitConfig>,
    next_id: u64,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

fn id_after(id: u64) -> Result<u64, StoreError> {
    id.checked_add(1)
        .ok_or_else(|| StoreError::Malformed(format!("override id {id} is out of range")))
}

impl Table {
    fn from_rows(configs: Vec<RateLimitConfig>) -> Result<Self, StoreError> {
        let mut table = Table::default();
        if let Some(max) = configs.iter().filter_map(|c| c.id).max() {
            table.next_id = id_after(max)?;
        }
        for config in configs {
            table.insert(config)?;
        }
        Ok(table)
    }

    fn key_taken(&self, config_value: &str, except: Option<u64>) -> bool {
        self.rows
            .values()
            .any(|row| row.config_value == config_value && row.id != except)
    }

    fn insert(&mut self, mut config: RateLimitConfig) -> Result<RateLimitConfig, StoreError> {
        if self.key_taken(&config.config_value, None) {
            return Err(StoreError::Conflict(config.config_value));
        }
        let id = match config.id {
            Some(id) if !self.rows.contains_key(&id) => id,
            _ => self.next_id,
        };
        self.next_id = self.next_id.max(id_after(id)?);
        config.id = Some(id);
        self.rows.insert(id, config.clone());
        Ok(config)
    }

    fn replace(
        &mut self,
        id: u64,
        mut config: RateLimitConfig,
    ) -> Result<RateLimitConfig, StoreError> {
        if !self.rows.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if self.key_taken(&config.config_value, Some(id)) {
            return Err(StoreError::Conflict(config.config_value));
        }
        config.id = Some(id);
        self.rows.insert(id, config.clone());
        Ok(config)
    }

    fn remove(&mut self, id: u64) -> Result<(), StoreError> {
        self.rows.remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }
}

/// Override table held in memory, optionally mirrored to a YAML file.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    table: RwLock<Table>,
    /// Snapshot destination, written before every mutation is committed
    path: Option<PathBuf>,
    /// Serializes mutations so each one starts from the last committed table
    writes: tokio::sync::Mutex<()>,
}

impl MemoryConfigStore {
    /// Create an empty, unpersisted table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table pre-populated with `configs`.
    pub fn with_configs(configs: Vec<RateLimitConfig>) -> Result<Self, StoreError> {
        Ok(Self {
            table: RwLock::new(Table::from_rows(configs)?),
            ..Self::default()
        })
    }

    /// Load the table from a YAML file and keep it in sync with that file.
    ///
    /// A missing file starts an empty table; the file is created on the
    /// first mutation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let configs = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse_yaml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(path = %path.display(), overrides = configs.len(), "Loaded rate limit overrides");

        Ok(Self {
            table: RwLock::new(Table::from_rows(configs)?),
            path: Some(path.to_path_buf()),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    /// Parse a YAML list of overrides. An empty document is an empty list.
    pub fn parse_yaml(yaml: &str) -> Result<Vec<RateLimitConfig>, StoreError> {
        if yaml.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| StoreError::Malformed(format!("failed to parse overrides: {}", e)))
    }

    fn snapshot(&self) -> Vec<RateLimitConfig> {
        self.table.read().rows.values().cloned().collect()
    }

    /// Apply `change` to a copy of the table, write the copy's snapshot and
    /// only then make it visible.
    ///
    /// A failed change or a failed write leaves the live table untouched.
    async fn commit<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Table) -> Result<T, StoreError> + Send,
    {
        let _guard = self.writes.lock().await;
        let mut next = self.table.read().clone();
        let output = change(&mut next)?;

        if let Some(path) = &self.path {
            let rows: Vec<&RateLimitConfig> = next.rows.values().collect();
            let yaml =
                serde_yaml::to_string(&rows).map_err(|e| StoreError::Malformed(e.to_string()))?;
            tokio::fs::write(path, yaml).await.map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to write overrides");
                StoreError::Unavailable(format!("failed to write {}: {}", path.display(), e))
            })?;
        }

        *self.table.write() = next;
        Ok(output)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<RateLimitConfig>, StoreError> {
        let table = self.table.read();
        Ok(table
            .rows
            .values()
            .find(|row| row.config_value == key)
            .cloned())
    }

    async fn get_by_id(&self, id: u64) -> Result<Option<RateLimitConfig>, StoreError> {
        Ok(self.table.read().rows.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<RateLimitConfig>, StoreError> {
        Ok(self.snapshot())
    }

    async fn create(&self, mut config: RateLimitConfig) -> Result<RateLimitConfig, StoreError> {
        config.id = None;
        self.commit(|table| table.insert(config)).await
    }

    async fn update(
        &self,
        id: u64,
        config: RateLimitConfig,
    ) -> Result<RateLimitConfig, StoreError> {
        self.commit(|table| table.replace(id, config)).await
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.commit(|table| table.remove(id)).await
    }
}
