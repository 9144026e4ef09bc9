// Catalog Configuration
// Pool connection settings, per-table routing, cache and capacity policy

use crate::db::traits::{CapacityLimits, DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_POOL: &str = "default";
pub const DEFAULT_SEPARATOR: &str = "|";

/// Connection configuration for one backend instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    /// Driver tag: "sqlite", "postgres", "memory"
    #[serde(rename = "type")]
    pub pool_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub min: u32,
    /// Upper bound of live connections, 0 opens a connection per request
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
    /// Overrides the driver's typing default
    #[serde(default)]
    pub strict_types: Option<bool>,
    /// Per-table provisioned throughput
    #[serde(default)]
    pub capacity: HashMap<String, CapacityLimits>,
    /// Backend-specific settings
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_max() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30_000
}

impl PoolConfig {
    pub fn new(name: &str, pool_type: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            pool_type: pool_type.to_string(),
            url: url.to_string(),
            min: 0,
            max: default_max(),
            idle_timeout_ms: None,
            acquire_timeout_ms: default_acquire_timeout(),
            query_timeout_ms: None,
            strict_types: None,
            capacity: HashMap::new(),
            options: serde_json::Map::new(),
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.name.is_empty() {
            return Err(DbError::InvalidConfig("Pool name is required".to_string()));
        }
        if self.pool_type.is_empty() {
            return Err(DbError::InvalidConfig(format!(
                "Pool type is required for pool {}",
                self.name
            )));
        }
        if self.max > 0 && self.min > self.max {
            return Err(DbError::InvalidConfig(format!(
                "Pool {}: min ({}) exceeds max ({})",
                self.name, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Per-table routing and caching policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TableConfig {
    /// Pin the table to a pool
    pub pool: Option<String>,
    /// Cache rows by primary key and invalidate on writes
    pub cache: bool,
    /// TTL in the external cache, none means no expiry
    pub cache_ttl_ms: Option<u64>,
    /// TTL in the in-process LRU, 0 disables that level
    pub lru_ttl_ms: u64,
    pub cache_prefix: Option<String>,
    /// Separator for joined columns
    pub separator: Option<String>,
    pub read_capacity: Option<f64>,
    pub write_capacity: Option<f64>,
}

impl TableConfig {
    pub fn separator(&self) -> &str {
        self.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    pub fn lru_ttl(&self) -> Option<Duration> {
        (self.lru_ttl_ms > 0).then(|| Duration::from_millis(self.lru_ttl_ms))
    }
}

/// In-process cache sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub lru_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { lru_capacity: 10_000 }
    }
}

/// Top-level configuration consumed by the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub default_pool: String,
    pub pools: Vec<PoolConfig>,
    pub tables: HashMap<String, TableConfig>,
    pub cache: CacheConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_pool: DEFAULT_POOL.to_string(),
            pools: vec![PoolConfig::new(DEFAULT_POOL, "memory", "")],
            tables: HashMap::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl CatalogConfig {
    pub fn from_json_str(text: &str) -> DbResult<Self> {
        let config: CatalogConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> DbResult<()> {
        for pool in &self.pools {
            pool.validate()?;
        }
        if !self.pools.iter().any(|p| p.name == self.default_pool) {
            return Err(DbError::InvalidConfig(format!(
                "Default pool {} is not configured",
                self.default_pool
            )));
        }
        for (table, tc) in &self.tables {
            if let Some(pool) = &tc.pool {
                if !self.pools.iter().any(|p| &p.name == pool) {
                    return Err(DbError::InvalidConfig(format!(
                        "Table {} is pinned to unknown pool {}",
                        table, pool
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, table: &str) -> TableConfig {
        self.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CatalogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pools[0].pool_type, "memory");
    }

    #[test]
    fn test_parse_json_config() {
        let config = CatalogConfig::from_json_str(
            r#"{
                "default_pool": "main",
                "pools": [
                    {"name": "main", "type": "sqlite", "url": "/tmp/x.db", "max": 2},
                    {"name": "kv", "type": "memory", "capacity": {"events": {"read": 5, "write": 2}}}
                ],
                "tables": {"events": {"pool": "kv", "cache": true, "lru_ttl_ms": 1000}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_pool, "main");
        assert_eq!(config.pools[0].max, 2);
        assert_eq!(config.pools[1].max, 5);
        assert_eq!(config.pools[1].capacity["events"].write, 2.0);
        let events = config.table("events");
        assert_eq!(events.pool.as_deref(), Some("kv"));
        assert_eq!(events.lru_ttl(), Some(Duration::from_millis(1000)));
        assert_eq!(events.separator(), "|");
        assert_eq!(config.table("other"), TableConfig::default());
    }

    #[test]
    fn test_unknown_pool_pin_rejected() {
        let mut config = CatalogConfig::default();
        config.tables.insert(
            "t".to_string(),
            TableConfig {
                pool: Some("nope".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(config.validate(), Err(DbError::InvalidConfig(_))));
    }

    #[test]
    fn test_min_over_max_rejected() {
        let mut pool = PoolConfig::new("p", "sqlite", "x.db");
        pool.min = 10;
        pool.max = 2;
        assert!(pool.validate().is_err());
    }
}
