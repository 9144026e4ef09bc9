// polystore
// One table API over SQLite, PostgreSQL and an in-memory item store

pub mod db;

pub use db::{
    Catalog, CatalogConfig, CompareOp, DbError, DbResult, ErrorKind, Op, QueryOptions, QueryResult,
    Record,
};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, `info` when unset; no-op if one is already installed
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
