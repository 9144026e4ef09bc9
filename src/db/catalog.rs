// Catalog
// Owns the schema registry, the live pools, hooks and caches; every operation goes through it

use crate::db::cache::{CacheFacade, CacheTransport, LocalCacheTransport};
use crate::db::capacity::CapacityFactors;
use crate::db::config::{CatalogConfig, PoolConfig, TableConfig};
use crate::db::registry::DriverRegistry;
use crate::db::request::{QueryOptions, Request};
use crate::db::schema::{SchemaRegistry, TableDeltas};
use crate::db::traits::{DbError, DbResult, Pool, Record};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wildcard table name for hooks that apply to every table
pub const ALL_TABLES: &str = "*";

/// Runs before shaping and may rewrite the caller's record
pub type PreHook = Arc<dyn Fn(&Request, &mut Record, &QueryOptions) + Send + Sync>;

/// Runs on each result row, returning true removes the row
pub type PostHook = Arc<dyn Fn(&Request, &mut Record, &QueryOptions) -> bool + Send + Sync>;

/// Process-wide counters
#[derive(Debug, Default)]
pub struct CatalogStats {
    pub queries: AtomicU64,
    pub errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl CatalogStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

pub struct Catalog {
    config: RwLock<CatalogConfig>,
    schema: SchemaRegistry,
    drivers: DriverRegistry,
    pools: RwLock<HashMap<String, Arc<dyn Pool>>>,
    pre_hooks: RwLock<Vec<(String, PreHook)>>,
    post_hooks: RwLock<Vec<(String, PostHook)>>,
    pub(crate) cache: CacheFacade,
    factors: RwLock<CapacityFactors>,
    pub(crate) stats: CatalogStats,
}

impl Catalog {
    /// Validate the configuration and register the built-in drivers; pools are created by `init`
    pub async fn new(config: CatalogConfig) -> DbResult<Self> {
        config.validate()?;
        let lru_capacity = config.cache.lru_capacity;
        Ok(Self {
            config: RwLock::new(config),
            schema: SchemaRegistry::new(),
            drivers: DriverRegistry::with_defaults().await,
            pools: RwLock::new(HashMap::new()),
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
            cache: CacheFacade::new(Arc::new(LocalCacheTransport::default()), lru_capacity),
            factors: RwLock::new(CapacityFactors::default()),
            stats: CatalogStats::default(),
        })
    }

    /// Replace the external cache transport
    pub fn with_transport(mut self, transport: Arc<dyn CacheTransport>) -> Self {
        self.cache = self.cache.with_transport(transport);
        self
    }

    /// Create every configured pool and load its live schema metadata
    pub async fn init(&self) -> DbResult<()> {
        let pools = self.config.read().pools.clone();
        for config in pools {
            let pool = self.create_pool(&config).await?;
            self.pools.write().insert(config.name.clone(), pool);
        }
        tracing::info!(pools = self.pools.read().len(), "Catalog initialized");
        Ok(())
    }

    async fn create_pool(&self, config: &PoolConfig) -> DbResult<Arc<dyn Pool>> {
        let driver = self.drivers.get_driver(&config.pool_type).await?;
        let pool = driver.create_pool(config).await?;
        if let Err(e) = pool.cache_columns().await {
            tracing::warn!(pool = %config.name, error = %e, "Failed to cache columns");
        }
        if let Err(e) = pool.cache_indexes().await {
            tracing::warn!(pool = %config.name, error = %e, "Failed to cache indexes");
        }
        tracing::info!(pool = %config.name, pool_type = %config.pool_type, "Pool created");
        Ok(pool)
    }

    /// Drain and drop every pool
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<dyn Pool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown().await;
            tracing::info!(pool = %pool.name(), "Pool closed");
        }
    }

    /// Apply a new configuration: changed pools are re-created, removed pools are closed
    pub async fn reconfigure(&self, config: CatalogConfig) -> DbResult<()> {
        config.validate()?;
        let old = self.config.read().clone();

        let mut created = Vec::new();
        for pool_config in &config.pools {
            let unchanged = old.pool(&pool_config.name) == Some(pool_config)
                && self.pools.read().contains_key(&pool_config.name);
            if !unchanged {
                created.push((pool_config.name.clone(), self.create_pool(pool_config).await?));
            }
        }

        let mut retired = Vec::new();
        {
            let mut pools = self.pools.write();
            for (name, pool) in created {
                if let Some(prev) = pools.insert(name, pool) {
                    retired.push(prev);
                }
            }
            let removed: Vec<String> = pools
                .keys()
                .filter(|name| config.pool(name.as_str()).is_none())
                .cloned()
                .collect();
            for name in removed {
                if let Some(prev) = pools.remove(&name) {
                    retired.push(prev);
                }
            }
        }
        *self.config.write() = config;

        for pool in retired {
            pool.shutdown().await;
            tracing::info!(pool = %pool.name(), "Pool retired");
        }
        Ok(())
    }

    /// Register a driver factory before `init`
    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn describe(&self, deltas: TableDeltas) {
        self.schema.describe(deltas);
    }

    pub fn describe_json(&self, value: &serde_json::Value) {
        self.schema.describe_json(value);
    }

    pub fn config(&self) -> CatalogConfig {
        self.config.read().clone()
    }

    pub fn table_config(&self, table: &str) -> TableConfig {
        self.config.read().table(table)
    }

    pub fn capacity_factors(&self) -> CapacityFactors {
        *self.factors.read()
    }

    pub fn set_capacity_factors(&self, factors: CapacityFactors) {
        *self.factors.write() = factors;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_pool(&self, name: &str) -> DbResult<Arc<dyn Pool>> {
        self.pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::PoolNotFound(name.to_string()))
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Explicit pool, then the table's pinned pool, then the default pool
    pub fn pool_for_table(&self, table: &str, pool: Option<&str>) -> DbResult<Arc<dyn Pool>> {
        let name = match pool {
            Some(name) => name.to_string(),
            None => {
                let config = self.config.read();
                config
                    .tables
                    .get(table)
                    .and_then(|tc| tc.pool.clone())
                    .unwrap_or_else(|| config.default_pool.clone())
            }
        };
        self.get_pool(&name)
    }

    /// Register a hook run before a request on `table` is shaped; `"*"` matches every table
    pub fn on_pre(&self, table: &str, hook: impl Fn(&Request, &mut Record, &QueryOptions) + Send + Sync + 'static) {
        let hook: PreHook = Arc::new(hook);
        self.pre_hooks.write().push((table.to_string(), hook));
    }

    /// Register a hook run on every result row of `table`; returning true drops the row
    pub fn on_post(
        &self,
        table: &str,
        hook: impl Fn(&Request, &mut Record, &QueryOptions) -> bool + Send + Sync + 'static,
    ) {
        let hook: PostHook = Arc::new(hook);
        self.post_hooks.write().push((table.to_string(), hook));
    }

    pub(crate) fn pre_hooks_for(&self, table: &str) -> Vec<PreHook> {
        self.pre_hooks
            .read()
            .iter()
            .filter(|(t, _)| t == table || t == ALL_TABLES)
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// Table-specific hooks first, then wildcard hooks
    pub(crate) fn post_hooks_for(&self, table: &str) -> Vec<PostHook> {
        let hooks = self.post_hooks.read();
        hooks
            .iter()
            .filter(|(t, _)| t == table)
            .chain(hooks.iter().filter(|(t, _)| t == ALL_TABLES && t != table))
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub(crate) fn run_pre_hooks(&self, request: &Request, record: &mut Record) {
        for hook in self.pre_hooks_for(&request.orig_table) {
            let result = catch_unwind(AssertUnwindSafe(|| hook(request, &mut *record, &request.options)));
            if result.is_err() {
                tracing::error!(table = %request.orig_table, op = %request.op, "Pre hook panicked");
            }
        }
    }

    /// Returns true when a hook vetoed the row
    pub(crate) fn run_post_hooks(&self, hooks: &[PostHook], request: &Request, row: &mut Record) -> bool {
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(request, &mut *row, &request.options))) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => {
                    tracing::error!(table = %request.orig_table, op = %request.op, "Post hook panicked");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::traits::Op;

    async fn catalog() -> Catalog {
        let catalog = Catalog::new(CatalogConfig::default()).await.unwrap();
        catalog.init().await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_default_pool_resolution() {
        let catalog = catalog().await;
        assert_eq!(catalog.pool_for_table("any", None).unwrap().name(), "default");
        assert!(matches!(
            catalog.pool_for_table("any", Some("nope")),
            Err(DbError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_adds_and_removes_pools() {
        let catalog = catalog().await;
        let mut config = CatalogConfig::default();
        config.pools.push(PoolConfig::new("kv", "memory", ""));
        config.tables.insert(
            "events".to_string(),
            TableConfig {
                pool: Some("kv".to_string()),
                ..Default::default()
            },
        );
        catalog.reconfigure(config).await.unwrap();
        assert_eq!(catalog.pool_names(), vec!["default", "kv"]);
        assert_eq!(catalog.pool_for_table("events", None).unwrap().name(), "kv");

        catalog.reconfigure(CatalogConfig::default()).await.unwrap();
        assert_eq!(catalog.pool_names(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_post_hook_order() {
        let catalog = catalog().await;
        catalog.on_post("*", |_, row, _| {
            row.insert("wild".into(), true.into());
            false
        });
        catalog.on_post("t", |_, row, _| {
            row.insert("own".into(), true.into());
            false
        });
        let hooks = catalog.post_hooks_for("t");
        assert_eq!(hooks.len(), 2);

        let request = Request::new(Op::Get, "t", Record::new(), QueryOptions::new());
        let mut row = Record::new();
        (hooks[0])(&request, &mut row, &request.options);
        assert!(row.contains_key("own"));
        assert_eq!(catalog.post_hooks_for("other").len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let catalog = catalog().await;
        catalog.on_post("t", |_, _, _| panic!("boom"));
        let request = Request::new(Op::Get, "t", Record::new(), QueryOptions::new());
        let hooks = catalog.post_hooks_for("t");
        let mut row = Record::new();
        assert!(!catalog.run_post_hooks(&hooks, &request, &mut row));
    }
}
