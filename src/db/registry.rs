// Driver Registry
// Maps backend type tags from configuration to pool drivers

use crate::db::drivers::{MemoryDriver, PostgresDriver, SqliteDriver};
use crate::db::traits::{DbError, PoolDriver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry for managing pool drivers
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn PoolDriver>>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in sqlite, postgres and memory drivers
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SqliteDriver)).await;
        registry.register(Arc::new(PostgresDriver)).await;
        registry.register(Arc::new(MemoryDriver)).await;
        registry
    }

    /// Register a driver under its type tag and aliases
    pub async fn register(&self, driver: Arc<dyn PoolDriver>) {
        let tag = driver.pool_type();
        let mut drivers = self.drivers.write().await;
        for alias in driver.aliases() {
            drivers.insert(alias.to_string(), driver.clone());
        }
        drivers.insert(tag.to_string(), driver);
        tracing::debug!(pool_type = tag, "Registered pool driver");
    }

    /// Get a driver by type tag
    pub async fn get_driver(&self, pool_type: &str) -> Result<Arc<dyn PoolDriver>, DbError> {
        let drivers = self.drivers.read().await;
        drivers
            .get(&pool_type.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DbError::DriverNotFound(pool_type.to_string()))
    }

    /// Get all registered type tags, aliases included
    pub async fn get_supported_types(&self) -> Vec<String> {
        let drivers = self.drivers.read().await;
        let mut types: Vec<String> = drivers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Check if a driver is registered for a given type tag
    pub async fn has_driver(&self, pool_type: &str) -> bool {
        let drivers = self.drivers.read().await;
        drivers.contains_key(&pool_type.to_ascii_lowercase())
    }

    /// Remove a driver and its aliases
    pub async fn unregister(&self, pool_type: &str) {
        let mut drivers = self.drivers.write().await;
        if let Some(driver) = drivers.remove(pool_type) {
            for alias in driver.aliases() {
                drivers.remove(*alias);
            }
        }
        tracing::debug!(pool_type, "Unregistered pool driver");
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::PoolConfig;
    use crate::db::traits::{DbResult, Pool};

    // Mock driver for testing
    struct MockDriver;

    #[async_trait::async_trait]
    impl PoolDriver for MockDriver {
        fn pool_type(&self) -> &'static str {
            "mock"
        }

        fn aliases(&self) -> &'static [&'static str] {
            &["fake"]
        }

        async fn create_pool(&self, _config: &PoolConfig) -> DbResult<Arc<dyn Pool>> {
            Err(DbError::ConnectionFailed("Mock".to_string()))
        }
    }

    #[tokio::test]
    async fn test_register_driver() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver)).await;

        assert!(registry.has_driver("mock").await);
        assert!(registry.has_driver("FAKE").await);
    }

    #[tokio::test]
    async fn test_get_driver() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver)).await;

        assert!(registry.get_driver("mock").await.is_ok());
        assert!(matches!(
            registry.get_driver("postgres").await,
            Err(DbError::DriverNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_driver() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver)).await;
        assert!(registry.has_driver("mock").await);

        registry.unregister("mock").await;
        assert!(!registry.has_driver("mock").await);
        assert!(!registry.has_driver("fake").await);
    }

    #[tokio::test]
    async fn test_default_drivers() {
        let registry = DriverRegistry::with_defaults().await;
        let types = registry.get_supported_types().await;
        for tag in ["memory", "pg", "postgres", "postgresql", "sqlite"] {
            assert!(types.contains(&tag.to_string()), "missing {}", tag);
        }
    }
}
