// Pool Driver Traits
// Defines the contract every storage backend implements and the shared error type

use crate::db::config::PoolConfig;
use crate::db::request::Request;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A single row or item, keyed by column name
pub type Record = Map<String, Value>;

pub type DbResult<T> = Result<T, DbError>;

/// Logical operation kinds understood by every pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
    Put,
    Incr,
    Update,
    Del,
    Get,
    Select,
    Search,
    List,
    Create,
    Upgrade,
    Drop,
    Sql,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Put => "put",
            Op::Incr => "incr",
            Op::Update => "update",
            Op::Del => "del",
            Op::Get => "get",
            Op::Select => "select",
            Op::Search => "search",
            Op::List => "list",
            Op::Create => "create",
            Op::Upgrade => "upgrade",
            Op::Drop => "drop",
            Op::Sql => "sql",
        }
    }

    /// add/put/incr/update
    pub fn is_update_family(&self) -> bool {
        matches!(self, Op::Add | Op::Put | Op::Incr | Op::Update)
    }

    /// Operations that address exactly one record by its primary key
    pub fn needs_keys(&self) -> bool {
        matches!(self, Op::Put | Op::Incr | Op::Update | Op::Del | Op::Get)
    }

    /// Operations after which a cached copy of the record is stale
    pub fn invalidates_cache(&self) -> bool {
        matches!(self, Op::Put | Op::Incr | Op::Update | Op::Del)
    }

    pub fn returns_rows(&self) -> bool {
        matches!(self, Op::Get | Op::Select | Op::Search | Op::List | Op::Sql)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic error taxonomy callers can branch on without knowing the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Connection,
    AlreadyExists,
    NotFound,
    Throttled,
    Unknown,
}

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Driver not found for pool type: {0}")]
    DriverNotFound(String),

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("Timeout error")]
    Timeout,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Throughput exceeded: {0}")]
    Throttled(String),

    #[error("Backend error {code}: {message}")]
    Native { code: String, message: String },

    #[error("Query execution error: {0}")]
    QueryError(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Validation(_) | DbError::InvalidConfig(_) | DbError::PoolNotFound(_) => {
                ErrorKind::Validation
            }
            DbError::ConnectionFailed(_)
            | DbError::DriverNotFound(_)
            | DbError::PoolError(_)
            | DbError::Timeout => ErrorKind::Connection,
            DbError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::Throttled(_) => ErrorKind::Throttled,
            _ => ErrorKind::Unknown,
        }
    }

    /// Connection-level failures make the checked out client unusable
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg) => DbError::Native {
                code: e.extended_code.to_string(),
                message: msg.unwrap_or_else(|| e.to_string()),
            },
            other => DbError::QueryError(other.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return DbError::Native {
                code: db.code().code().to_string(),
                message: db.message().to_string(),
            };
        }
        if err.is_closed() {
            return DbError::ConnectionFailed(err.to_string());
        }
        DbError::QueryError(err.to_string())
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for DbError {
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => DbError::Timeout,
            bb8::RunError::User(e) => DbError::PoolError(e.to_string()),
        }
    }
}

/// Column information discovered from a live backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub column_default: Option<String>,
    pub ordinal_position: i32,
}

/// Provisioned read/write throughput for a table or one of its indexes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacityLimits {
    pub read: f64,
    pub write: f64,
}

/// Live schema metadata cached per pool
#[derive(Debug, Default)]
pub struct PoolMetadata {
    /// table -> column -> info
    pub dbcolumns: HashMap<String, HashMap<String, ColumnInfo>>,
    /// table -> primary key columns in key order
    pub dbkeys: HashMap<String, Vec<String>>,
    /// table -> index name -> columns
    pub dbindexes: HashMap<String, HashMap<String, Vec<String>>>,
    /// table or "table/index" -> provisioned capacity
    pub dbcapacity: HashMap<String, CapacityLimits>,
}

impl PoolMetadata {
    /// Drop everything known about a table, used after drop/migrate
    pub fn invalidate(&mut self, table: &str) {
        self.dbcolumns.remove(table);
        self.dbkeys.remove(table);
        self.dbindexes.remove(table);
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.dbcolumns.contains_key(table)
    }
}

/// Behavior switches the request preparer and executor consult
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Coerce values to declared column types before writing
    pub strict_types: bool,
    /// Objects and arrays are stored as-is instead of JSON text
    pub native_json: bool,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub query_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn from_config(config: &PoolConfig, strict_default: bool, native_json: bool) -> Self {
        Self {
            strict_types: config.strict_types.unwrap_or(strict_default),
            native_json,
            max_connections: config.max,
            min_connections: config.min,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            query_timeout: config.query_timeout_ms.map(Duration::from_millis),
            idle_timeout: config.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Raw outcome of one native query before normalization
#[derive(Debug, Default)]
pub struct NativeResult {
    pub rows: Vec<Record>,
    pub affected_rows: Option<u64>,
    pub inserted_oid: Option<Value>,
    pub next_token: Option<Value>,
    pub consumed_capacity: Option<f64>,
    /// The backend returned more rows than requested
    pub more: bool,
}

/// State shared by all pool implementations
pub struct PoolBase {
    pub config: PoolConfig,
    pub settings: PoolSettings,
    pub meta: RwLock<PoolMetadata>,
}

impl PoolBase {
    pub fn new(config: PoolConfig, settings: PoolSettings) -> Self {
        let mut meta = PoolMetadata::default();
        for (table, limits) in &config.capacity {
            meta.dbcapacity.insert(table.clone(), *limits);
        }
        Self {
            config,
            settings,
            meta: RwLock::new(meta),
        }
    }
}

/// A checked out native connection
#[async_trait::async_trait]
pub trait PoolClient: Send + Sync {
    fn client_id(&self) -> &str;

    /// Test if the connection is alive
    async fn is_alive(&self) -> bool;

    /// Allow downcasting for driver-specific operations
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Connection pool for one backend instance
#[async_trait::async_trait]
pub trait Pool: Send + Sync {
    fn base(&self) -> &PoolBase;

    fn pool_type(&self) -> &'static str;

    fn name(&self) -> &str {
        &self.base().config.name
    }

    fn settings(&self) -> &PoolSettings {
        &self.base().settings
    }

    fn metadata(&self) -> &RwLock<PoolMetadata> {
        &self.base().meta
    }

    // --- Connection Management ---
    /// Obtain a native connection, waiting for a free slot when the pool is bounded
    async fn open(&self) -> DbResult<Box<dyn PoolClient>>;

    /// Return a connection; dropping the client hands it back to its pool
    async fn close(&self, client: Box<dyn PoolClient>) {
        drop(client);
    }

    /// Drain live connections
    async fn shutdown(&self) {}

    // --- Query Execution ---
    /// Backend-specific last-mile transformation, fills `request.statements` or equivalent
    fn prepare(&self, request: &mut Request) -> DbResult<()>;

    async fn query(&self, client: &dyn PoolClient, request: &Request) -> DbResult<NativeResult>;

    /// Redirect an operation to another physical table
    fn resolve_table(
        &self,
        _op: Op,
        table: &str,
        _record: &Record,
        _options: &crate::db::request::QueryOptions,
    ) -> String {
        table.to_string()
    }

    /// Map a native error into the generic taxonomy
    fn convert_error(&self, _table: &str, _op: Op, err: DbError) -> DbError {
        err
    }

    /// Cursor for the page after `rows`
    fn next_token(&self, _request: &Request, _rows: &[Record], native: &NativeResult) -> Option<Value> {
        native.next_token.clone()
    }

    // --- Schema Metadata ---
    /// Refresh `dbcolumns` and `dbkeys` from the live backend
    async fn cache_columns(&self) -> DbResult<()>;

    /// Refresh `dbindexes` (and `dbcapacity` where the backend reports it)
    async fn cache_indexes(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Factory for pools of one backend type
#[async_trait::async_trait]
pub trait PoolDriver: Send + Sync {
    /// Backend type tag this driver registers under
    fn pool_type(&self) -> &'static str;

    /// Alternative tags accepted in configuration
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    async fn create_pool(&self, config: &PoolConfig) -> DbResult<Arc<dyn Pool>>;
}
