// SQLite Driver
// Pool over rusqlite connections managed by bb8

use crate::db::config::PoolConfig;
use crate::db::request::Request;
use crate::db::sql::{self, SqlStyle};
use crate::db::traits::{
    ColumnInfo, DbError, DbResult, NativeResult, Op, Pool, PoolBase, PoolClient, PoolDriver,
    PoolSettings, Record,
};
use bb8::{ManageConnection, PooledConnection};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection as RusqliteConnection, OpenFlags};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// bb8 manager opening rusqlite connections to one database file
pub struct SqliteManager {
    path: String,
}

impl SqliteManager {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl ManageConnection for SqliteManager {
    type Connection = RusqliteConnection;
    type Error = rusqlite::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        SqliteDriver::open_connection(&self.path)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

enum SqliteConn {
    Pooled(PooledConnection<'static, SqliteManager>),
    Direct(RusqliteConnection),
}

impl std::ops::Deref for SqliteConn {
    type Target = RusqliteConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            SqliteConn::Pooled(conn) => &**conn,
            SqliteConn::Direct(conn) => conn,
        }
    }
}

/// SQLite specific connection wrapper
pub struct SqliteClient {
    id: String,
    conn: tokio::sync::Mutex<SqliteConn>,
}

#[async_trait::async_trait]
impl PoolClient for SqliteClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        self.conn.lock().await.execute_batch("SELECT 1").is_ok()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// SQLite pool; `max = 0` opens a fresh connection per request
pub struct SqlitePool {
    base: PoolBase,
    path: String,
    pool: Option<bb8::Pool<SqliteManager>>,
    clients: AtomicU64,
}

impl SqlitePool {
    pub async fn connect(config: PoolConfig) -> DbResult<Self> {
        let path = SqliteDriver::get_database_path(&config)?;
        let settings = PoolSettings::from_config(&config, true, false);
        let pool = if settings.max_connections > 0 {
            let mut builder = bb8::Pool::builder()
                .max_size(settings.max_connections)
                .connection_timeout(settings.acquire_timeout)
                .idle_timeout(settings.idle_timeout);
            if settings.min_connections > 0 {
                builder = builder.min_idle(Some(settings.min_connections));
            }
            let pool = builder
                .build(SqliteManager::new(path.clone()))
                .await
                .map_err(|e| DbError::ConnectionFailed(format!("Failed to open SQLite database: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        tracing::info!(pool = %config.name, path = %path, "SQLite pool ready");
        Ok(Self {
            base: PoolBase::new(config, settings),
            path,
            pool,
            clients: AtomicU64::new(0),
        })
    }

    fn client(client: &dyn PoolClient) -> DbResult<&SqliteClient> {
        client
            .as_any()
            .downcast_ref::<SqliteClient>()
            .ok_or_else(|| DbError::ConnectionFailed("Invalid SQLite client".to_string()))
    }

    fn run(conn: &RusqliteConnection, request: &Request) -> DbResult<NativeResult> {
        let mut result = NativeResult::default();
        let mut affected = 0u64;
        for statement in &request.statements {
            let params: Vec<SqlValue> = statement.values.iter().map(to_sql_value).collect();
            let mut stmt = conn.prepare(&statement.text)?;
            if stmt.column_count() > 0 {
                let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                while let Some(row) = rows.next()? {
                    let mut record = Record::new();
                    for (idx, name) in names.iter().enumerate() {
                        record.insert(name.clone(), from_value_ref(row.get_ref(idx)?));
                    }
                    result.rows.push(record);
                }
            } else {
                affected += stmt.execute(rusqlite::params_from_iter(params.iter()))? as u64;
            }
        }
        result.affected_rows = Some(affected);
        if request.op == Op::Add && affected > 0 {
            result.inserted_oid = Some(Value::from(conn.last_insert_rowid()));
        }
        Ok(result)
    }

    fn read_columns(conn: &RusqliteConnection) -> DbResult<Vec<(String, Vec<ColumnInfo>)>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT name
            FROM sqlite_master
            WHERE type = 'table'
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
        "#,
        )?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT cid, name, type, "notnull", dflt_value, pk
            FROM pragma_table_info(?)
            ORDER BY cid
        "#,
        )?;
        let mut out = Vec::new();
        for table in tables {
            let columns: Vec<ColumnInfo> = stmt
                .query_map([&table], |row| {
                    let data_type: String = row.get(2)?;
                    let notnull: i32 = row.get(3)?;
                    let pk: i32 = row.get(5)?;
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        data_type: SqliteDriver::sqlite_type_to_string(Some(&data_type)),
                        is_nullable: notnull == 0 && pk == 0,
                        is_primary_key: pk > 0,
                        column_default: row.get(4)?,
                        // Key position for primary columns, otherwise declaration order
                        ordinal_position: if pk > 0 { pk } else { row.get(0)? },
                    })
                })?
                .collect::<Result<_, _>>()?;
            out.push((table, columns));
        }
        Ok(out)
    }

    fn read_indexes(conn: &RusqliteConnection, tables: &[String]) -> DbResult<Vec<(String, HashMap<String, Vec<String>>)>> {
        let mut list = conn.prepare("SELECT name FROM pragma_index_list(?)")?;
        let mut info = conn.prepare("SELECT name FROM pragma_index_info(?) ORDER BY seqno")?;
        let mut out = Vec::new();
        for table in tables {
            let names: Vec<String> = list
                .query_map([table], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            let mut indexes = HashMap::new();
            for name in names {
                let columns: Vec<String> = info
                    .query_map([&name], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                indexes.insert(name, columns);
            }
            out.push((table.clone(), indexes));
        }
        Ok(out)
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

#[async_trait::async_trait]
impl Pool for SqlitePool {
    fn base(&self) -> &PoolBase {
        &self.base
    }

    fn pool_type(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self) -> DbResult<Box<dyn PoolClient>> {
        let conn = match &self.pool {
            Some(pool) => SqliteConn::Pooled(pool.get_owned().await?),
            None => SqliteConn::Direct(SqliteDriver::open_connection(&self.path)?),
        };
        let n = self.clients.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SqliteClient {
            id: format!("{}-{}", self.name(), n),
            conn: tokio::sync::Mutex::new(conn),
        }))
    }

    fn prepare(&self, request: &mut Request) -> DbResult<()> {
        let existing: HashSet<String> = self
            .metadata()
            .read()
            .dbcolumns
            .get(&request.table)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        request.statements = sql::build(SqlStyle::Sqlite, request, &existing)?;
        Ok(())
    }

    async fn query(&self, client: &dyn PoolClient, request: &Request) -> DbResult<NativeResult> {
        let client = Self::client(client)?;
        let conn = client.conn.lock().await;
        let mut result = Self::run(&conn, request)?;
        sql::page_rows(request, &mut result);
        Ok(result)
    }

    fn convert_error(&self, table: &str, _op: Op, err: DbError) -> DbError {
        match err {
            // SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE
            DbError::Native { code, message } if code == "1555" || code == "2067" => {
                DbError::AlreadyExists(format!("{}: {}", table, message))
            }
            DbError::Native { message, .. } if message.contains("no such table") => {
                DbError::NotFound(message)
            }
            DbError::Native { code, message } if code == "5" || code == "6" => {
                DbError::Throttled(message)
            }
            other => other,
        }
    }

    async fn cache_columns(&self) -> DbResult<()> {
        let client = self.open().await?;
        let tables = {
            let client = Self::client(client.as_ref())?;
            let conn = client.conn.lock().await;
            Self::read_columns(&conn)?
        };
        let mut meta = self.metadata().write();
        meta.dbcolumns.clear();
        meta.dbkeys.clear();
        for (table, columns) in tables {
            let mut keys: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_primary_key).collect();
            keys.sort_by_key(|c| c.ordinal_position);
            meta.dbkeys
                .insert(table.clone(), keys.iter().map(|c| c.name.clone()).collect());
            meta.dbcolumns.insert(
                table,
                columns.into_iter().map(|c| (c.name.clone(), c)).collect(),
            );
        }
        Ok(())
    }

    async fn cache_indexes(&self) -> DbResult<()> {
        let tables: Vec<String> = self.metadata().read().dbcolumns.keys().cloned().collect();
        let client = self.open().await?;
        let indexes = {
            let client = Self::client(client.as_ref())?;
            let conn = client.conn.lock().await;
            Self::read_indexes(&conn, &tables)?
        };
        let mut meta = self.metadata().write();
        meta.dbindexes.clear();
        for (table, idx) in indexes {
            meta.dbindexes.insert(table, idx);
        }
        Ok(())
    }
}

/// SQLite driver implementation
pub struct SqliteDriver;

impl SqliteDriver {
    /// Extract database path from config
    fn get_database_path(config: &PoolConfig) -> DbResult<String> {
        let url = config
            .url
            .strip_prefix("sqlite://")
            .or_else(|| config.url.strip_prefix("sqlite:"))
            .unwrap_or(&config.url);
        if url.is_empty() {
            return Err(DbError::InvalidConfig(
                "SQLite database path is required".to_string(),
            ));
        }

        // Expand ~ to home directory if present
        let path = match (url.strip_prefix("~/"), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => Path::new(&home).join(rest).to_string_lossy().to_string(),
            _ => url.to_string(),
        };

        Ok(path)
    }

    /// Open SQLite connection
    fn open_connection(path: &str) -> Result<RusqliteConnection, rusqlite::Error> {
        let conn = RusqliteConnection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Convert SQLite type to string
    fn sqlite_type_to_string(sqlite_type: Option<&str>) -> String {
        match sqlite_type {
            Some("INTEGER") => "integer".to_string(),
            Some("REAL") => "real".to_string(),
            Some("TEXT") => "text".to_string(),
            Some("BLOB") => "blob".to_string(),
            Some("") | None => "any".to_string(),
            Some(t) => t.to_lowercase(),
        }
    }
}

#[async_trait::async_trait]
impl PoolDriver for SqliteDriver {
    fn pool_type(&self) -> &'static str {
        "sqlite"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["sqlite3"]
    }

    async fn create_pool(&self, config: &PoolConfig) -> DbResult<Arc<dyn Pool>> {
        Ok(Arc::new(SqlitePool::connect(config.clone()).await?))
    }
}
