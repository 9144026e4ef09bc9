// PostgreSQL Driver
// Pool over tokio-postgres clients managed by bb8-postgres

use crate::db::config::PoolConfig;
use crate::db::request::Request;
use crate::db::sql::{self, SqlStyle};
use crate::db::traits::{
    ColumnInfo, DbError, DbResult, NativeResult, Op, Pool, PoolBase, PoolClient, PoolDriver,
    PoolSettings, Record,
};
use bb8::PooledConnection;
use bb8_postgres::PostgresConnectionManager as Bb8PostgresManager;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};

pub type PostgresPoolInner = bb8::Pool<Bb8PostgresManager<NoTls>>;

/// JSON value bound as whatever type the server expects for the parameter
#[derive(Debug)]
struct PgValue<'a>(&'a Value);

type BoxError = Box<dyn Error + Sync + Send>;

impl PgValue<'_> {
    fn as_i64(&self) -> Result<i64, BoxError> {
        match self.0 {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| "number out of range".into()),
            Value::Bool(b) => Ok(*b as i64),
            Value::String(s) => Ok(s.trim().parse::<i64>()?),
            other => Err(format!("cannot bind {} as integer", other).into()),
        }
    }

    fn as_f64(&self) -> Result<f64, BoxError> {
        match self.0 {
            Value::Number(n) => n.as_f64().ok_or_else(|| "number out of range".into()),
            Value::String(s) => Ok(s.trim().parse::<f64>()?),
            other => Err(format!("cannot bind {} as float", other).into()),
        }
    }

    fn as_bool(&self) -> bool {
        match self.0 {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
            Value::String(s) => matches!(s.as_str(), "true" | "t" | "1" | "yes"),
            _ => false,
        }
    }

    fn as_text(&self) -> String {
        match self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_datetime(&self) -> Result<DateTime<Utc>, BoxError> {
        match self.0 {
            Value::Number(_) => Utc
                .timestamp_millis_opt(self.as_i64()?)
                .single()
                .ok_or_else(|| "timestamp out of range".into()),
            Value::String(s) => Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
            other => Err(format!("cannot bind {} as timestamp", other).into()),
        }
    }
}

impl ToSql for PgValue<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::BOOL => self.as_bool().to_sql(ty, out),
            Type::INT2 => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT8 => self.as_i64()?.to_sql(ty, out),
            Type::FLOAT4 => (self.as_f64()? as f32).to_sql(ty, out),
            Type::FLOAT8 => self.as_f64()?.to_sql(ty, out),
            Type::JSON | Type::JSONB => match self.0 {
                // JSON stored as text by an untyped caller
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(parsed) => parsed.to_sql(ty, out),
                    Err(_) => self.0.to_sql(ty, out),
                },
                other => other.to_sql(ty, out),
            },
            Type::TIMESTAMPTZ => self.as_datetime()?.to_sql(ty, out),
            Type::TIMESTAMP => self.as_datetime()?.naive_utc().to_sql(ty, out),
            Type::BYTEA => self.as_text().into_bytes().to_sql(ty, out),
            _ => self.as_text().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn decode(row: &Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|f| Value::from(f as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|d| Value::String(d.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|d| Value::String(d.and_utc().to_rfc3339())),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned())),
        _ => row.try_get::<_, Option<String>>(idx).ok().flatten().map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn to_record(row: &Row) -> Result<Record, tokio_postgres::Error> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), decode(row, idx)?);
    }
    Ok(record)
}

enum PgConn {
    Pooled(PooledConnection<'static, Bb8PostgresManager<NoTls>>),
    Direct(Client),
}

impl std::ops::Deref for PgConn {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        match self {
            PgConn::Pooled(conn) => &**conn,
            PgConn::Direct(conn) => conn,
        }
    }
}

/// PostgreSQL specific connection wrapper
pub struct PostgresClient {
    id: String,
    conn: PgConn,
}

#[async_trait::async_trait]
impl PoolClient for PostgresClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        !self.conn.is_closed() && self.conn.simple_query("SELECT 1").await.is_ok()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// PostgreSQL pool; `max = 0` opens a fresh connection per request
pub struct PostgresPool {
    base: PoolBase,
    pool: Option<PostgresPoolInner>,
    clients: AtomicU64,
}

impl PostgresPool {
    pub async fn connect(config: PoolConfig) -> DbResult<Self> {
        if config.url.is_empty() {
            return Err(DbError::InvalidConfig(
                "PostgreSQL connection url is required".to_string(),
            ));
        }
        let settings = PoolSettings::from_config(&config, true, true);
        let pool = if settings.max_connections > 0 {
            let manager = Bb8PostgresManager::new_from_stringlike(config.url.as_str(), NoTls)
                .map_err(|e| DbError::InvalidConfig(e.to_string()))?;
            let mut builder = bb8::Pool::builder()
                .max_size(settings.max_connections)
                .connection_timeout(settings.acquire_timeout)
                .idle_timeout(settings.idle_timeout);
            if settings.min_connections > 0 {
                builder = builder.min_idle(Some(settings.min_connections));
            }
            let pool = builder
                .build(manager)
                .await
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
            Some(pool)
        } else {
            config
                .url
                .parse::<tokio_postgres::Config>()
                .map_err(|e| DbError::InvalidConfig(e.to_string()))?;
            None
        };
        tracing::info!(pool = %config.name, "PostgreSQL pool ready");
        Ok(Self {
            base: PoolBase::new(config, settings),
            pool,
            clients: AtomicU64::new(0),
        })
    }

    fn client(client: &dyn PoolClient) -> DbResult<&PostgresClient> {
        client
            .as_any()
            .downcast_ref::<PostgresClient>()
            .ok_or_else(|| DbError::ConnectionFailed("Invalid PostgreSQL client".to_string()))
    }

    async fn connect_direct(&self) -> DbResult<Client> {
        let (client, connection) = tokio_postgres::connect(&self.base.config.url, NoTls)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        let name = self.name().to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(pool = %name, error = %e, "PostgreSQL connection closed");
            }
        });
        Ok(client)
    }

    async fn read_columns(client: &Client) -> DbResult<Vec<(String, ColumnInfo)>> {
        let rows = client
            .query(
                r#"
                SELECT
                    c.table_name::text,
                    c.column_name::text,
                    c.data_type::text,
                    c.is_nullable = 'YES' AS is_nullable,
                    c.column_default::text,
                    c.ordinal_position::int4,
                    k.ordinal_position::int4 AS key_position
                FROM information_schema.columns c
                LEFT JOIN information_schema.table_constraints tc
                    ON tc.table_schema = c.table_schema
                    AND tc.table_name = c.table_name
                    AND tc.constraint_type = 'PRIMARY KEY'
                LEFT JOIN information_schema.key_column_usage k
                    ON k.constraint_name = tc.constraint_name
                    AND k.table_schema = c.table_schema
                    AND k.table_name = c.table_name
                    AND k.column_name = c.column_name
                WHERE c.table_schema = current_schema()
                ORDER BY c.table_name, c.ordinal_position
            "#,
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, ColumnInfo), tokio_postgres::Error> {
                let key_position: Option<i32> = row.try_get(6)?;
                let ordinal: i32 = row.try_get(5)?;
                Ok((
                    row.try_get(0)?,
                    ColumnInfo {
                        name: row.try_get(1)?,
                        data_type: row.try_get::<_, String>(2)?.to_lowercase(),
                        is_nullable: row.try_get(3)?,
                        is_primary_key: key_position.is_some(),
                        column_default: row.try_get(4)?,
                        ordinal_position: key_position.unwrap_or(ordinal),
                    },
                ))
            })
            .collect::<Result<_, tokio_postgres::Error>>()
            .map_err(DbError::from)
    }

    async fn read_indexes(client: &Client) -> DbResult<Vec<(String, String, String)>> {
        let rows = client
            .query(
                r#"
                SELECT t.relname::text, i.relname::text, a.attname::text
                FROM pg_index x
                JOIN pg_class t ON t.oid = x.indrelid
                JOIN pg_class i ON i.oid = x.indexrelid
                JOIN pg_namespace n ON n.oid = t.relnamespace
                JOIN LATERAL unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) ON true
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                WHERE n.nspname = current_schema()
                ORDER BY t.relname, i.relname, k.ord
            "#,
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String, String), tokio_postgres::Error> {
                Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
            })
            .collect::<Result<_, tokio_postgres::Error>>()
            .map_err(DbError::from)
    }
}

#[async_trait::async_trait]
impl Pool for PostgresPool {
    fn base(&self) -> &PoolBase {
        &self.base
    }

    fn pool_type(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self) -> DbResult<Box<dyn PoolClient>> {
        let conn = match &self.pool {
            Some(pool) => PgConn::Pooled(pool.get_owned().await?),
            None => PgConn::Direct(self.connect_direct().await?),
        };
        let n = self.clients.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(PostgresClient {
            id: format!("{}-{}", self.name(), n),
            conn,
        }))
    }

    async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            let state = pool.state();
            tracing::debug!(
                pool = %self.name(),
                connections = state.connections,
                idle = state.idle_connections,
                "Shutting down PostgreSQL pool"
            );
        }
    }

    fn prepare(&self, request: &mut Request) -> DbResult<()> {
        let existing: HashSet<String> = self
            .metadata()
            .read()
            .dbcolumns
            .get(&request.table)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        request.statements = sql::build(SqlStyle::Postgres, request, &existing)?;
        Ok(())
    }

    async fn query(&self, client: &dyn PoolClient, request: &Request) -> DbResult<NativeResult> {
        let client = &Self::client(client)?.conn;
        let mut result = NativeResult::default();
        let mut affected = 0u64;
        for statement in &request.statements {
            let values: Vec<PgValue> = statement.values.iter().map(PgValue).collect();
            let params: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            let prepared = client.prepare(&statement.text).await?;
            if prepared.columns().is_empty() {
                affected += client.execute(&prepared, &params).await?;
            } else {
                for row in client.query(&prepared, &params).await? {
                    result.rows.push(to_record(&row)?);
                }
            }
        }
        result.affected_rows = Some(affected);
        sql::page_rows(request, &mut result);
        Ok(result)
    }

    fn convert_error(&self, table: &str, _op: Op, err: DbError) -> DbError {
        match err {
            DbError::Native { code, message } if code == "23505" => {
                DbError::AlreadyExists(format!("{}: {}", table, message))
            }
            DbError::Native { code, message } if code == "42P01" => DbError::NotFound(message),
            DbError::Native { code, message } if code == "53300" || code == "57P03" => {
                DbError::Throttled(message)
            }
            other => other,
        }
    }

    async fn cache_columns(&self) -> DbResult<()> {
        let client = self.open().await?;
        let columns = Self::read_columns(&Self::client(client.as_ref())?.conn).await?;
        let mut dbcolumns: HashMap<String, HashMap<String, ColumnInfo>> = HashMap::new();
        let mut keyed: HashMap<String, Vec<(i32, String)>> = HashMap::new();
        for (table, info) in columns {
            if info.is_primary_key {
                keyed
                    .entry(table.clone())
                    .or_default()
                    .push((info.ordinal_position, info.name.clone()));
            }
            dbcolumns.entry(table).or_default().insert(info.name.clone(), info);
        }
        let mut meta = self.metadata().write();
        meta.dbkeys = keyed
            .into_iter()
            .map(|(table, mut keys)| {
                keys.sort();
                (table, keys.into_iter().map(|(_, k)| k).collect())
            })
            .collect();
        meta.dbcolumns = dbcolumns;
        Ok(())
    }

    async fn cache_indexes(&self) -> DbResult<()> {
        let client = self.open().await?;
        let rows = Self::read_indexes(&Self::client(client.as_ref())?.conn).await?;
        let mut indexes: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
        for (table, index, column) in rows {
            indexes
                .entry(table)
                .or_default()
                .entry(index)
                .or_default()
                .push(column);
        }
        self.metadata().write().dbindexes = indexes;
        Ok(())
    }
}

/// PostgreSQL driver implementation
pub struct PostgresDriver;

#[async_trait::async_trait]
impl PoolDriver for PostgresDriver {
    fn pool_type(&self) -> &'static str {
        "postgres"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["postgresql", "pg"]
    }

    async fn create_pool(&self, config: &PoolConfig) -> DbResult<Arc<dyn Pool>> {
        Ok(Arc::new(PostgresPool::connect(config.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: Value, ty: &Type) -> Result<BytesMut, BoxError> {
        let mut out = BytesMut::new();
        PgValue(&value).to_sql(ty, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_bind_by_target_type() {
        assert_eq!(&encode(json!(7), &Type::INT4).unwrap()[..], &7i32.to_be_bytes());
        assert_eq!(&encode(json!("42"), &Type::INT8).unwrap()[..], &42i64.to_be_bytes());
        assert_eq!(&encode(json!(true), &Type::BOOL).unwrap()[..], &[1u8]);
        assert_eq!(&encode(json!(5), &Type::TEXT).unwrap()[..], b"5");
        assert!(encode(json!("x"), &Type::INT4).is_err());
    }

    #[test]
    fn test_narrow_int_out_of_range_rejected() {
        assert!(encode(json!(70_000), &Type::INT2).is_err());
        assert!(encode(json!(5_000_000_000i64), &Type::INT4).is_err());
        assert_eq!(&encode(json!(-3), &Type::INT2).unwrap()[..], &(-3i16).to_be_bytes());
    }

    #[test]
    fn test_null_binds_as_null() {
        let mut out = BytesMut::new();
        let is_null = PgValue(&Value::Null).to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[tokio::test]
    async fn test_missing_url_rejected() {
        let config = PoolConfig::new("pg", "postgres", "");
        assert!(matches!(
            PostgresPool::connect(config).await,
            Err(DbError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_error_conversion() {
        let mut config = PoolConfig::new("pg", "postgres", "postgres://user@localhost/db");
        config.max = 0;
        let pool = PostgresPool::connect(config).await.unwrap();
        let dup = DbError::Native {
            code: "23505".to_string(),
            message: "duplicate key".to_string(),
        };
        assert!(matches!(
            pool.convert_error("t", Op::Add, dup),
            DbError::AlreadyExists(_)
        ));
        let missing = DbError::Native {
            code: "42P01".to_string(),
            message: "relation does not exist".to_string(),
        };
        assert!(matches!(
            pool.convert_error("t", Op::Get, missing),
            DbError::NotFound(_)
        ));
    }
}
