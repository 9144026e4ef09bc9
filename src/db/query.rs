// Query Executor
// Runs prepared requests against their pool and normalizes rows and execution info

use crate::db::catalog::Catalog;
use crate::db::prepare::{coerce_value, text};
use crate::db::request::{QueryOptions, QueryResult, Request, Statement};
use crate::db::schema::{ColumnType, TableSchema};
use crate::db::traits::{DbError, DbResult, NativeResult, Op, Pool, Record};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;

impl Catalog {
    /// Execute a prepared request
    ///
    /// The connection is always handed back before post-processing starts. Rows are
    /// never partially applied: either the native call succeeds for the whole request
    /// or the converted error is returned.
    pub async fn query(&self, mut req: Request) -> DbResult<QueryResult> {
        let pool = self.get_pool(&req.pool)?;
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let native = match execute(pool.as_ref(), &req).await {
            Ok(native) => native,
            Err(err) => {
                let err = pool.convert_error(&req.table, req.op, err);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                if !req.options.quiet {
                    let record = Value::Object(req.orig.clone());
                    tracing::warn!(
                        table = %req.table,
                        op = %req.op,
                        pool = %req.pool,
                        elapsed_ms = req.started.elapsed().as_millis() as u64,
                        record = %record,
                        error = %err,
                        "Query failed"
                    );
                }
                return Err(err);
            }
        };

        req.info.affected_rows = native.affected_rows.unwrap_or(native.rows.len() as u64);
        req.info.inserted_oid = native.inserted_oid.clone();
        req.info.next_token = pool.next_token(&req, &native.rows, &native);
        req.info.consumed_capacity = native.consumed_capacity;

        let rows = self.post_process(&req, native.rows);

        if req.op.invalidates_cache() && self.table_config(&req.orig_table).cache {
            self.del_cache(&req.orig_table, &req.record, &req.options).await;
        }

        req.info.elapsed_ms = req.started.elapsed().as_millis() as u64;
        tracing::debug!(
            table = %req.table,
            op = %req.op,
            pool = %req.pool,
            rows = rows.len(),
            affected = req.info.affected_rows,
            elapsed_ms = req.info.elapsed_ms,
            "Query complete"
        );
        Ok(QueryResult { rows, info: req.info })
    }

    fn post_process(&self, req: &Request, rows: Vec<Record>) -> Vec<Record> {
        if rows.is_empty() {
            return rows;
        }
        let options = &req.options;
        let separator = self.table_config(&req.orig_table).separator().to_string();
        let hooks = self.post_hooks_for(&req.orig_table);
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(rows.len());

        for mut row in rows {
            if let Some(unique) = &options.unique {
                let key = row.get(unique).map(text).unwrap_or_default();
                if !seen.insert(key) {
                    continue;
                }
            }
            decode_row(&req.schema, &mut row, &separator);
            if options.cleanup {
                cleanup_row(&req.schema, &mut row, options.admin);
            }
            if !hooks.is_empty() && self.run_post_hooks(&hooks, req, &mut row) {
                continue;
            }
            if let Some(filter) = &options.filter {
                if !filter.matches(&row) {
                    continue;
                }
            }
            out.push(row);
            if options.first {
                break;
            }
        }
        out
    }

    /// Prepare and execute in one call
    pub async fn run(&self, op: Op, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        let req = self.prepare(op, table, record, options)?;
        self.query(req).await
    }

    pub async fn add(&self, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Add, table, record, options).await
    }

    pub async fn put(&self, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Put, table, record, options).await
    }

    pub async fn update(&self, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Update, table, record, options).await
    }

    pub async fn incr(&self, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Incr, table, record, options).await
    }

    pub async fn del(&self, table: &str, record: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Del, table, record, options).await
    }

    /// Single record by primary key, served from the cache when `options.cached` is set
    pub async fn get(&self, table: &str, query: Record, options: QueryOptions) -> DbResult<Option<Record>> {
        if options.cached {
            return self.get_cached(table, query, options).await;
        }
        Ok(self.run(Op::Get, table, query, options).await?.into_first())
    }

    pub async fn select(&self, table: &str, query: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Select, table, query, options).await
    }

    /// Select with a prefix match on the first key condition
    pub async fn search(&self, table: &str, query: Record, options: QueryOptions) -> DbResult<QueryResult> {
        self.run(Op::Search, table, query, options).await
    }

    /// Point lookups for many primary keys at once
    pub async fn list(&self, table: &str, keys: Vec<Record>, options: QueryOptions) -> DbResult<QueryResult> {
        let req = self.prepare_list(table, keys, options)?;
        if req.records.is_empty() {
            return Ok(QueryResult::default());
        }
        self.query(req).await
    }

    /// Raw statement passthrough for SQL pools; `None` uses the default pool
    pub async fn query_sql(&self, pool: Option<&str>, sql: &str, values: Vec<Value>) -> DbResult<QueryResult> {
        let pool = self.pool_for_table("", pool)?;
        let mut req = Request::new(Op::Sql, "", Record::new(), QueryOptions::new());
        req.pool = pool.name().to_string();
        req.text = Some(sql.to_string());
        req.statements = vec![Statement::new(sql, values)];
        pool.prepare(&mut req)?;
        self.query(req).await
    }
}

/// Acquire, run and release; panics and timeouts become errors
async fn execute(pool: &dyn Pool, req: &Request) -> DbResult<NativeResult> {
    let settings = pool.settings();
    let client = tokio::time::timeout(settings.acquire_timeout, pool.open())
        .await
        .map_err(|_| DbError::Timeout)??;

    let run = AssertUnwindSafe(pool.query(client.as_ref(), req)).catch_unwind();
    let outcome = match settings.query_timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .unwrap_or(Ok(Err(DbError::Timeout))),
        None => run.await,
    };
    pool.close(client).await;

    outcome.unwrap_or_else(|_| {
        tracing::error!(table = %req.table, op = %req.op, pool = %req.pool, "Driver panicked");
        Err(DbError::QueryError(format!("{} on {} panicked", req.op, req.table)))
    })
}

/// Native values back to the declared column types, then split unjoin columns
fn decode_row(schema: &TableSchema, row: &mut Record, separator: &str) {
    if schema.is_empty() {
        return;
    }
    for (name, col) in &schema.columns {
        let Some(value) = row.get_mut(name) else {
            continue;
        };
        let decoded = match (col.col_type(), &*value) {
            (ColumnType::Bool, Value::Number(_)) => Some(coerce_value(value, ColumnType::Bool)),
            (t, Value::String(s)) if t.is_json() => match serde_json::from_str::<Value>(s) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!(table = %schema.name, column = %name, error = %e, "Stored value is not valid JSON");
                    None
                }
            },
            _ => None,
        };
        if let Some(decoded) = decoded {
            *value = decoded;
        }
    }

    for (name, col) in &schema.columns {
        let Some(parts) = &col.unjoin else {
            continue;
        };
        let Some(Value::String(joined)) = row.get(name) else {
            continue;
        };
        let sep = col.separator.as_deref().unwrap_or(separator);
        let pieces: Vec<String> = joined.split(sep).map(str::to_string).collect();
        for (part, piece) in parts.iter().zip(pieces) {
            if row.get(part).map_or(false, |v| !v.is_null()) {
                continue;
            }
            let value = match schema.column(part).and_then(|c| c.col_type) {
                Some(t) => coerce_value(&Value::String(piece), t),
                None => Value::String(piece),
            };
            row.insert(part.clone(), value);
        }
    }
}

/// Remove columns the caller may not see
fn cleanup_row(schema: &TableSchema, row: &mut Record, admin: bool) {
    row.retain(|name, _| match schema.column(name) {
        Some(col) => !col.is_secure() && (admin || !col.is_admin_only()),
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::{CatalogConfig, PoolConfig, TableConfig};
    use crate::db::traits::ErrorKind;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn catalog() -> Catalog {
        let mut config = CatalogConfig::default();
        config.tables.insert(
            "users".to_string(),
            TableConfig {
                cache: true,
                ..Default::default()
            },
        );
        let catalog = Catalog::new(config).await.unwrap();
        catalog.init().await.unwrap();
        catalog.describe_json(&json!({
            "users": {
                "id": {"type": "int", "primary": 1},
                "name": {},
                "status": {},
                "password": {"secure": true},
                "notes": {"admin": true},
            }
        }));
        catalog.create_table("users", None).await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_put_get_del() {
        let catalog = catalog().await;
        catalog
            .put("users", record(json!({"id": 1, "name": "a"})), QueryOptions::new())
            .await
            .unwrap();
        let row = catalog
            .get("users", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], json!("a"));

        let res = catalog
            .del("users", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(res.info.affected_rows, 1);
        assert!(catalog
            .get("users", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_add_is_already_exists() {
        let catalog = catalog().await;
        catalog
            .add("users", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap();
        let err = catalog
            .add("users", record(json!({"id": 1})), QueryOptions::new().quiet())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(catalog.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_cleanup_unique_and_filter() {
        let catalog = catalog().await;
        for (id, status) in [(1, "a"), (2, "a"), (3, "b")] {
            catalog
                .put(
                    "users",
                    record(json!({"id": id, "status": status, "password": "p", "notes": "n"})),
                    QueryOptions::new(),
                )
                .await
                .unwrap();
        }

        let rows = catalog
            .select("users", Record::new(), QueryOptions::new().cleanup(false))
            .await
            .unwrap()
            .rows;
        assert_eq!(rows.len(), 3);
        assert!(!rows[0].contains_key("password"));
        assert!(!rows[0].contains_key("notes"));

        let options = QueryOptions {
            unique: Some("status".to_string()),
            ..Default::default()
        };
        let rows = catalog.select("users", Record::new(), options).await.unwrap().rows;
        assert_eq!(rows.len(), 2);

        let options = QueryOptions::new().with_filter(|r| r["id"] != json!(2));
        let rows = catalog.select("users", Record::new(), options).await.unwrap().rows;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_post_hook_veto() {
        let catalog = catalog().await;
        catalog
            .put("users", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap();
        catalog
            .put("users", record(json!({"id": 2})), QueryOptions::new())
            .await
            .unwrap();
        catalog.on_post("users", |_, row, _| row["id"] == json!(1));
        let rows = catalog
            .select("users", Record::new(), QueryOptions::new())
            .await
            .unwrap()
            .rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(2));
    }

    #[tokio::test]
    async fn test_list_by_keys() {
        let catalog = catalog().await;
        for id in 1..=3 {
            catalog
                .put("users", record(json!({"id": id})), QueryOptions::new())
                .await
                .unwrap();
        }
        let res = catalog
            .list(
                "users",
                vec![record(json!({"id": 1})), record(json!({"id": 3})), record(json!({"id": 9}))],
                QueryOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(res.len(), 2);
    }

    #[tokio::test]
    async fn test_sql_passthrough_on_sqlite() {
        let mut config = CatalogConfig::default();
        config.pools.push(PoolConfig::new("sql", "sqlite", ":memory:"));
        config.pools.last_mut().unwrap().max = 1;
        let catalog = Catalog::new(config).await.unwrap();
        catalog.init().await.unwrap();

        let res = catalog
            .query_sql(Some("sql"), "SELECT ? + 1 AS n", vec![json!(41)])
            .await
            .unwrap();
        assert_eq!(res.rows[0]["n"], json!(42));

        let err = catalog
            .query_sql(None, "SELECT 1", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn test_decode_unjoin_and_json() {
        let registry = crate::db::schema::SchemaRegistry::new();
        registry.describe_json(&json!({
            "t": {
                "key": {"unjoin": ["kind", "num"]},
                "num": {"type": "int"},
                "meta": {"type": "obj"},
                "flag": {"type": "bool"},
            }
        }));
        let schema = registry.get_table("t").unwrap();
        let mut row = record(json!({"key": "a|7", "meta": "{\"x\":1}", "flag": 1}));
        decode_row(&schema, &mut row, "|");
        assert_eq!(row["kind"], json!("a"));
        assert_eq!(row["num"], json!(7));
        assert_eq!(row["key"], json!("a|7"));
        assert_eq!(row["meta"], json!({"x": 1}));
        assert_eq!(row["flag"], json!(true));

        let mut bad = record(json!({"meta": "{oops"}));
        decode_row(&schema, &mut bad, "|");
        assert_eq!(bad["meta"], json!("{oops"));
    }
}
