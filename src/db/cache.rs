// Cache Facade
// Two-level record cache keyed by primary key: in-process LRU over an external transport

use crate::db::catalog::Catalog;
use crate::db::config::TableConfig;
use crate::db::request::QueryOptions;
use crate::db::traits::{DbResult, Op, Record};
use moka::sync::Cache;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// External key/value cache service
#[async_trait::async_trait]
pub trait CacheTransport: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> DbResult<()>;

    async fn del(&self, key: &str) -> DbResult<()>;
}

#[derive(Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Process-local transport for single-node deployments and tests
pub struct LocalCacheTransport {
    entries: Cache<String, Entry<Arc<str>>>,
}

impl LocalCacheTransport {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_entries).build(),
        }
    }
}

impl Default for LocalCacheTransport {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait::async_trait]
impl CacheTransport for LocalCacheTransport {
    async fn get(&self, key: &str) -> DbResult<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.to_string())),
            Some(_) => {
                self.entries.invalidate(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> DbResult<()> {
        self.entries
            .insert(key.to_string(), Entry::new(Arc::from(value), ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> DbResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }
}

/// Both cache levels
pub struct CacheFacade {
    transport: Arc<dyn CacheTransport>,
    lru: Cache<String, Entry<Arc<Record>>>,
}

impl CacheFacade {
    pub fn new(transport: Arc<dyn CacheTransport>, lru_capacity: u64) -> Self {
        Self {
            transport,
            lru: Cache::builder().max_capacity(lru_capacity).build(),
        }
    }

    pub fn with_transport(&self, transport: Arc<dyn CacheTransport>) -> Self {
        Self {
            transport,
            lru: self.lru.clone(),
        }
    }

    fn lru_get(&self, key: &str) -> Option<Record> {
        match self.lru.get(key) {
            Some(entry) if entry.is_live() => Some(entry.value.as_ref().clone()),
            Some(_) => {
                self.lru.invalidate(key);
                None
            }
            None => None,
        }
    }

    /// Look up both levels, transport failures count as misses
    async fn lookup(&self, key: &str, tc: &TableConfig) -> Option<Record> {
        let lru_ttl = tc.lru_ttl();
        if lru_ttl.is_some() {
            if let Some(row) = self.lru_get(key) {
                return Some(row);
            }
        }
        let text = match self.transport.get(key).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cache transport get failed");
                return None;
            }
        };
        match serde_json::from_str::<Record>(&text) {
            Ok(row) => {
                if lru_ttl.is_some() {
                    self.lru
                        .insert(key.to_string(), Entry::new(Arc::new(row.clone()), lru_ttl));
                }
                Some(row)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Cached value is not a record");
                None
            }
        }
    }

    async fn store(&self, key: &str, row: &Record, tc: &TableConfig) {
        if let Some(ttl) = tc.lru_ttl() {
            self.lru
                .insert(key.to_string(), Entry::new(Arc::new(row.clone()), Some(ttl)));
        }
        match serde_json::to_string(row) {
            Ok(text) => {
                if let Err(e) = self.transport.put(key, &text, tc.cache_ttl()).await {
                    tracing::warn!(key, error = %e, "Cache transport put failed");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "Record is not serializable"),
        }
    }

    async fn remove(&self, key: &str) {
        self.lru.invalidate(key);
        if let Err(e) = self.transport.del(key).await {
            tracing::warn!(key, error = %e, "Cache transport del failed");
        }
    }
}

fn key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Catalog {
    /// Cache key for the record's primary key, None when any key value is missing
    pub fn cache_key(&self, table: &str, record: &Record, options: &QueryOptions) -> Option<String> {
        if let Some(key) = &options.cache_key {
            return Some(key.clone());
        }
        let keys = self.schema().get_keys(table);
        if keys.is_empty() {
            return None;
        }
        let parts: Option<Vec<String>> = keys
            .iter()
            .map(|k| record.get(k).filter(|v| !v.is_null()).map(key_part))
            .collect();
        let prefix = options
            .cache_prefix
            .clone()
            .or_else(|| self.table_config(table).cache_prefix)
            .unwrap_or_else(|| table.to_string());
        parts.map(|parts| format!("{}:{}", prefix, parts.join(":")))
    }

    /// Get a record through the cache, reading the database on a miss and populating both levels
    pub async fn get_cached(&self, table: &str, query: Record, options: QueryOptions) -> DbResult<Option<Record>> {
        let tc = self.table_config(table);
        let Some(key) = self.cache_key(table, &query, &options) else {
            return self.get_uncached(table, query, options).await;
        };

        if let Some(row) = self.cache.lookup(&key, &tc).await {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(table, key = %key, "Cache hit");
            return Ok(Some(row));
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let row = self.get_uncached(table, query, options).await?;
        if let Some(row) = &row {
            self.cache.store(&key, row, &tc).await;
        }
        Ok(row)
    }

    async fn get_uncached(&self, table: &str, query: Record, options: QueryOptions) -> DbResult<Option<Record>> {
        let request = self.prepare(Op::Get, table, query, options)?;
        Ok(self.query(request).await?.into_first())
    }

    /// Store a record in both cache levels
    pub async fn put_cache(&self, table: &str, record: &Record, options: &QueryOptions) {
        if let Some(key) = self.cache_key(table, record, options) {
            let tc = self.table_config(table);
            self.cache.store(&key, record, &tc).await;
        }
    }

    /// Remove a record from both cache levels
    pub async fn del_cache(&self, table: &str, record: &Record, options: &QueryOptions) {
        if let Some(key) = self.cache_key(table, record, options) {
            tracing::debug!(table, key = %key, "Cache invalidate");
            self.cache.remove(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_roundtrip() {
        let transport = LocalCacheTransport::default();
        transport.put("k", "v", None).await.unwrap();
        assert_eq!(transport.get("k").await.unwrap().as_deref(), Some("v"));
        transport.del("k").await.unwrap();
        assert_eq!(transport.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_transport_expiry() {
        let transport = LocalCacheTransport::default();
        transport
            .put("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(transport.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_key_part_strings_unquoted() {
        assert_eq!(key_part(&Value::String("a".into())), "a");
        assert_eq!(key_part(&Value::from(5)), "5");
    }
}
