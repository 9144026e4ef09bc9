// Table Maintenance
// Create, upgrade, drop and copy-through-temp-table migration of registered tables

use crate::db::bulk::ScanOptions;
use crate::db::catalog::Catalog;
use crate::db::request::QueryOptions;
use crate::db::schema::{ColumnDef, ColumnType, TableDeltas};
use crate::db::traits::{DbResult, Op, Pool, Record};
use std::sync::Arc;
use std::time::Duration;

/// Row transform used while migrating; returning false skips the row
pub type RowTransform = Arc<dyn Fn(&mut Record) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MigrateOptions {
    /// Defaults to `<table>_tmp`
    pub tmp_table: Option<String>,
    /// Applied while copying into the temp table
    pub pre_process: Option<RowTransform>,
    /// Applied while copying back into the recreated table
    pub post_process: Option<RowTransform>,
    pub keep_tmp: bool,
    /// Settle time between phases for backends that provision tables asynchronously
    pub delay: Duration,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateResult {
    pub copied_out: u64,
    pub copied_back: u64,
}

impl Catalog {
    pub async fn create_table(&self, table: &str, pool: Option<&str>) -> DbResult<()> {
        self.run_ddl(Op::Create, table, pool).await
    }

    /// Add columns and indexes the live table is missing
    pub async fn upgrade_table(&self, table: &str, pool: Option<&str>) -> DbResult<()> {
        self.run_ddl(Op::Upgrade, table, pool).await
    }

    pub async fn drop_table(&self, table: &str, pool: Option<&str>) -> DbResult<()> {
        self.run_ddl(Op::Drop, table, pool).await
    }

    async fn run_ddl(&self, op: Op, table: &str, pool: Option<&str>) -> DbResult<()> {
        let options = QueryOptions {
            pool: pool.map(str::to_string),
            ..Default::default()
        };
        let req = self.prepare(op, table, Record::new(), options)?;
        let pool = self.get_pool(&req.pool)?;
        let physical = req.table.clone();
        self.query(req).await?;
        if op == Op::Drop {
            pool.metadata().write().invalidate(&physical);
        }
        refresh_metadata(pool.as_ref()).await;
        tracing::info!(table, pool = %pool.name(), op = %op, "Table maintenance done");
        Ok(())
    }

    /// Create missing and upgrade existing registered tables, optionally only those of one pool
    pub async fn create_tables(&self, pool: Option<&str>) -> DbResult<()> {
        for table in self.schema().tables() {
            let owner = self.pool_for_table(&table, None)?;
            if pool.map_or(false, |p| p != owner.name()) {
                continue;
            }
            let exists = owner.metadata().read().has_table(&table);
            if exists {
                self.upgrade_table(&table, Some(owner.name())).await?;
            } else {
                self.create_table(&table, Some(owner.name())).await?;
            }
        }
        Ok(())
    }

    /// Rebuild a table from its current definition, keeping its rows
    ///
    /// Rows are copied into a temp table that holds every live column, the table is
    /// dropped and recreated, and rows are copied back through `post_process`.
    pub async fn migrate(&self, table: &str, opts: MigrateOptions) -> DbResult<MigrateResult> {
        let pool = self.pool_for_table(table, opts.pool.as_deref())?;
        let pool_name = pool.name().to_string();
        let tmp = opts
            .tmp_table
            .clone()
            .unwrap_or_else(|| format!("{}_tmp", table));

        let mut columns = self.schema().get_columns(table);
        {
            let meta = pool.metadata().read();
            if let Some(live) = meta.dbcolumns.get(table) {
                for name in live.keys() {
                    columns
                        .entry(name.clone())
                        .or_insert_with(|| ColumnDef::new(ColumnType::Text));
                }
            }
        }
        let mut deltas = TableDeltas::new();
        deltas.insert(tmp.clone(), columns);
        self.describe(deltas);

        self.drop_table(&tmp, Some(&pool_name)).await?;
        self.create_table(&tmp, Some(&pool_name)).await?;
        settle(opts.delay).await;

        let copied_out = self
            .copy_rows(table, &tmp, &pool_name, opts.pre_process.as_ref())
            .await?;
        tracing::info!(table, tmp = %tmp, rows = copied_out, "Migrate: copied to temp table");

        self.drop_table(table, Some(&pool_name)).await?;
        settle(opts.delay).await;
        self.create_table(table, Some(&pool_name)).await?;
        settle(opts.delay).await;

        let copied_back = self
            .copy_rows(&tmp, table, &pool_name, opts.post_process.as_ref())
            .await?;
        tracing::info!(table, tmp = %tmp, rows = copied_back, "Migrate: copied back");

        if !opts.keep_tmp {
            self.drop_table(&tmp, Some(&pool_name)).await?;
            self.schema().forget(&tmp);
        }
        Ok(MigrateResult {
            copied_out,
            copied_back,
        })
    }

    async fn copy_rows(&self, from: &str, to: &str, pool: &str, transform: Option<&RowTransform>) -> DbResult<u64> {
        let options = QueryOptions::new().with_pool(pool);
        let mut scanner = self.scanner(
            from,
            Record::new(),
            ScanOptions {
                options: options.clone(),
                ..Default::default()
            },
        );
        let mut copied = 0;
        while let Some(rows) = scanner.next_page().await? {
            for mut row in rows {
                if let Some(transform) = transform {
                    if !transform(&mut row) {
                        continue;
                    }
                }
                self.put(to, row, options.clone().raw()).await?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

async fn refresh_metadata(pool: &dyn Pool) {
    if let Err(e) = pool.cache_columns().await {
        tracing::warn!(pool = %pool.name(), error = %e, "Failed to refresh columns");
    }
    if let Err(e) = pool.cache_indexes().await {
        tracing::warn!(pool = %pool.name(), error = %e, "Failed to refresh indexes");
    }
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::{CatalogConfig, PoolConfig};
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn sqlite_catalog(dir: &tempfile::TempDir) -> Catalog {
        let path = dir.path().join("maint.db");
        let mut config = CatalogConfig::default();
        config.pools = vec![PoolConfig::new("default", "sqlite", &path.to_string_lossy())];
        let catalog = Catalog::new(config).await.unwrap();
        catalog.init().await.unwrap();
        catalog.describe_json(&json!({
            "users": {
                "id": {"type": "int", "primary": 1},
                "name": {"type": "text", "index": 1},
            }
        }));
        catalog
    }

    #[tokio::test]
    async fn test_create_tables_then_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = sqlite_catalog(&dir).await;
        catalog.create_tables(None).await.unwrap();

        let pool = catalog.get_pool("default").unwrap();
        assert!(pool.metadata().read().has_table("users"));
        assert_eq!(pool.metadata().read().dbkeys["users"], vec!["id"]);

        catalog.describe_json(&json!({"users": {"email": {"type": "text"}}}));
        catalog.create_tables(None).await.unwrap();
        assert!(pool.metadata().read().dbcolumns["users"].contains_key("email"));
        assert!(pool.metadata().read().dbindexes["users"].contains_key("users_index"));
    }

    #[tokio::test]
    async fn test_drop_invalidates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = sqlite_catalog(&dir).await;
        catalog.create_table("users", None).await.unwrap();
        catalog.drop_table("users", None).await.unwrap();
        let pool = catalog.get_pool("default").unwrap();
        assert!(!pool.metadata().read().has_table("users"));
    }

    #[tokio::test]
    async fn test_migrate_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = sqlite_catalog(&dir).await;
        catalog.create_table("users", None).await.unwrap();
        for id in 1..=3 {
            catalog
                .put("users", record(json!({"id": id, "name": format!("u{}", id)})), QueryOptions::new())
                .await
                .unwrap();
        }

        catalog.describe_json(&json!({"users": {"email": {"type": "text"}}}));
        let post: RowTransform = Arc::new(|row: &mut Record| {
            let email = format!("{}@example.com", row["name"].as_str().unwrap_or_default());
            row.insert("email".to_string(), Value::String(email));
            true
        });
        let result = catalog
            .migrate(
                "users",
                MigrateOptions {
                    post_process: Some(post),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result, MigrateResult { copied_out: 3, copied_back: 3 });

        let row = catalog
            .get("users", record(json!({"id": 2})), QueryOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["email"], json!("u2@example.com"));
        assert!(catalog.schema().get_table("users_tmp").is_none());
        let pool = catalog.get_pool("default").unwrap();
        assert!(!pool.metadata().read().has_table("users_tmp"));
    }

    #[tokio::test]
    async fn test_migrate_keeps_writeonly_columns() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = sqlite_catalog(&dir).await;
        catalog.describe_json(&json!({
            "secrets": {
                "id": {"type": "int", "primary": 1},
                "w": {"type": "text", "writeonly": true},
                "code": {"type": "text", "maxlength": 2},
            }
        }));
        catalog.create_table("secrets", None).await.unwrap();
        catalog
            .put("secrets", record(json!({"id": 1, "code": "ab"})), QueryOptions::new())
            .await
            .unwrap();
        catalog
            .update("secrets", record(json!({"id": 1, "w": "secret"})), QueryOptions::new())
            .await
            .unwrap();

        // Tighter limit after the row was stored
        catalog.describe_json(&json!({"secrets": {"code": {"maxlength": 1}}}));
        let result = catalog.migrate("secrets", MigrateOptions::default()).await.unwrap();
        assert_eq!(result, MigrateResult { copied_out: 1, copied_back: 1 });

        let row = catalog
            .get("secrets", record(json!({"id": 1})), QueryOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["w"], json!("secret"));
        assert_eq!(row["code"], json!("ab"));
    }
}
