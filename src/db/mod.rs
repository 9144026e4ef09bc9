// Database Module
// Schema registry, pools and drivers, and the request pipeline built on them

pub mod bulk;
pub mod cache;
pub mod capacity;
pub mod catalog;
pub mod config;
pub mod drivers;
pub mod geo;
pub mod maintenance;
pub mod prepare;
pub mod query;
pub mod registry;
pub mod request;
pub mod schema;
pub mod sql;
pub mod traits;

// ============================================================================
// Re-exports
// ============================================================================

pub use bulk::{BatchItem, BulkOptions, BulkResult, ReplaceOptions, ScanOptions, Scanner};
pub use cache::{CacheTransport, LocalCacheTransport};
pub use capacity::{check_capacity, Capacity, CapacityFactors, CapacityOptions, TokenBucket};
pub use catalog::{Catalog, StatsSnapshot, ALL_TABLES};
pub use config::{CacheConfig, CatalogConfig, PoolConfig, TableConfig};
pub use drivers::{MemoryDriver, PostgresDriver, SqliteDriver};
pub use geo::{GeoOptions, GeoResult, GeoState};
pub use maintenance::{MigrateOptions, MigrateResult, RowTransform};
pub use registry::DriverRegistry;
pub use request::{CompareOp, QueryInfo, QueryOptions, QueryResult, Request};
pub use schema::{ColumnDef, ColumnType, IndexDef, SchemaRegistry, TableDeltas, TableSchema};
pub use traits::{
    DbError, DbResult, ErrorKind, NativeResult, Op, Pool, PoolClient, PoolDriver, PoolSettings,
    Record,
};
