use polystore::db::capacity::{check_capacity, CapacityOptions};
use polystore::db::{CatalogConfig, PoolConfig, TableConfig};
use polystore::{Catalog, DbError, ErrorKind, QueryOptions, Record};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

fn schema() -> Value {
    json!({
        "users": {
            "id": {"type": "int", "primary": 1},
            "name": {"type": "text"},
            "score": {"type": "double"},
            "active": {"type": "bool"},
            "meta": {"type": "obj"},
            "tags": {"type": "array"},
        },
        "pairs": {
            "key": {"primary": 1, "join": ["kind", "name"], "unjoin": ["kind", "name"]},
            "size": {"type": "int"},
        },
        "tasks": {
            "id": {"type": "int", "primary": 1},
            "status": {"type": "text"},
        }
    })
}

async fn memory_catalog() -> Catalog {
    let mut config = CatalogConfig::default();
    config.tables.insert(
        "users".to_string(),
        TableConfig {
            cache: true,
            lru_ttl_ms: 60_000,
            ..Default::default()
        },
    );
    config.tables.insert(
        "tasks".to_string(),
        TableConfig {
            read_capacity: Some(10.0),
            ..Default::default()
        },
    );
    let catalog = Catalog::new(config).await.unwrap();
    catalog.init().await.unwrap();
    catalog.describe_json(&schema());
    catalog.create_tables(None).await.unwrap();
    catalog
}

async fn sqlite_catalog(dir: &tempfile::TempDir) -> Catalog {
    let path = dir.path().join("pipeline.db");
    let config = CatalogConfig {
        pools: vec![PoolConfig::new("default", "sqlite", &path.to_string_lossy())],
        ..Default::default()
    };
    let catalog = Catalog::new(config).await.unwrap();
    catalog.init().await.unwrap();
    catalog.describe_json(&schema());
    catalog.create_tables(None).await.unwrap();
    catalog
}

#[tokio::test]
async fn test_keys_follow_latest_describe() {
    let catalog = memory_catalog().await;
    assert_eq!(catalog.schema().get_keys("users"), vec!["id"]);
    catalog.describe_json(&json!({"users": {"name": {"primary": 2}}}));
    assert_eq!(catalog.schema().get_keys("users"), vec!["id", "name"]);
}

#[tokio::test]
async fn test_describe_twice_is_idempotent() {
    let catalog = memory_catalog().await;
    let before = catalog.schema().get_table("users").unwrap();
    catalog.describe_json(&schema());
    assert_eq!(*before, *catalog.schema().get_table("users").unwrap());
}

#[tokio::test]
async fn test_sqlite_typed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = sqlite_catalog(&dir).await;
    let input = json!({
        "id": 7,
        "name": "ann",
        "score": 2.5,
        "active": true,
        "meta": {"plan": "pro", "seats": 3},
        "tags": ["a", "b"],
    });
    catalog
        .add("users", record(input.clone()), QueryOptions::new())
        .await
        .unwrap();

    let row = catalog
        .get("users", record(json!({"id": "7"})), QueryOptions::new())
        .await
        .unwrap()
        .unwrap();
    for (column, value) in input.as_object().unwrap() {
        assert_eq!(&row[column], value, "column {}", column);
    }
}

#[tokio::test]
async fn test_join_and_unjoin() {
    let catalog = memory_catalog().await;
    catalog
        .put("pairs", record(json!({"kind": "x", "name": "y", "size": 1})), QueryOptions::new())
        .await
        .unwrap();
    let row = catalog
        .get("pairs", record(json!({"kind": "x", "name": "y"})), QueryOptions::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["key"], json!("x|y"));
    assert_eq!(row["kind"], json!("x"));
    assert_eq!(row["name"], json!("y"));

    let dir = tempfile::tempdir().unwrap();
    let catalog = sqlite_catalog(&dir).await;
    catalog
        .put("pairs", record(json!({"kind": "x", "name": "y", "size": "3"})), QueryOptions::new())
        .await
        .unwrap();
    let row = catalog
        .get("pairs", record(json!({"key": "x|y"})), QueryOptions::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["size"], json!(3));
    assert_eq!(row["kind"], json!("x"));
    assert_eq!(row["name"], json!("y"));
}

#[tokio::test]
async fn test_duplicate_add_and_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = sqlite_catalog(&dir).await;
    catalog
        .add("users", record(json!({"id": 1})), QueryOptions::new())
        .await
        .unwrap();
    let err = catalog
        .add("users", record(json!({"id": 1})), QueryOptions::new().quiet())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let queries = catalog.stats().queries;
    let err = catalog
        .update("users", record(json!({"name": "x"})), QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(catalog.stats().queries, queries);
}

#[tokio::test]
async fn test_cache_hit_and_invalidation() {
    let catalog = memory_catalog().await;
    let row = record(json!({"id": 1, "name": "first"}));
    catalog.put("users", row.clone(), QueryOptions::new()).await.unwrap();
    catalog.put_cache("users", &row, &QueryOptions::new()).await;

    let queries = catalog.stats().queries;
    let cached = catalog
        .get("users", record(json!({"id": 1})), QueryOptions::new().cached())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached["name"], json!("first"));
    assert_eq!(catalog.stats().queries, queries);
    assert_eq!(catalog.stats().cache_hits, 1);

    catalog
        .update("users", record(json!({"id": 1, "name": "second"})), QueryOptions::new())
        .await
        .unwrap();
    let queries = catalog.stats().queries;
    let fresh = catalog
        .get("users", record(json!({"id": 1})), QueryOptions::new().cached())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh["name"], json!("second"));
    assert_eq!(catalog.stats().queries, queries + 1);
    assert_eq!(catalog.stats().cache_misses, 1);

    // The miss repopulated both levels
    catalog
        .get("users", record(json!({"id": 1})), QueryOptions::new().cached())
        .await
        .unwrap();
    assert_eq!(catalog.stats().queries, queries + 1);
}

#[tokio::test]
async fn test_get_without_key_skips_cache() {
    let catalog = memory_catalog().await;
    assert!(catalog
        .cache_key("users", &record(json!({"name": "x"})), &QueryOptions::new())
        .is_none());
    let err = catalog
        .get("users", record(json!({"name": "x"})), QueryOptions::new().cached())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn test_configured_capacity_paces_eleventh_call() {
    let catalog = memory_catalog().await;
    let capacity = catalog.get_capacity("tasks", &CapacityOptions::default());
    assert_eq!(capacity.rate, 10.0);
    assert_eq!(capacity.max, 10.0);

    let started = Instant::now();
    for _ in 0..10 {
        check_capacity(&capacity, 1.0).await;
    }
    assert!(started.elapsed() < Duration::from_millis(50));
    let before = Instant::now();
    check_capacity(&capacity, 1.0).await;
    assert!(before.elapsed() >= Duration::from_millis(80));
}

async fn paged_select(catalog: &Catalog) {
    for id in 1..=8 {
        let status = if id <= 5 { "active" } else { "closed" };
        catalog
            .put("tasks", record(json!({"id": id, "status": status})), QueryOptions::new())
            .await
            .unwrap();
    }
    let query = record(json!({"status": "active"}));
    let first = catalog
        .select("tasks", query.clone(), QueryOptions::new().with_count(2))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.info.next_token.is_some());

    let rest = catalog
        .select("tasks", query, QueryOptions::new().with_start(first.info.next_token.clone()))
        .await
        .unwrap();
    assert_eq!(rest.len(), 3);
    assert!(rest.info.next_token.is_none());

    let mut ids: Vec<i64> = first
        .rows
        .iter()
        .chain(rest.rows.iter())
        .filter_map(|r| r["id"].as_i64())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_select_pages_on_memory() {
    let catalog = memory_catalog().await;
    paged_select(&catalog).await;
}

#[tokio::test]
async fn test_select_pages_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = sqlite_catalog(&dir).await;
    paged_select(&catalog).await;
}

#[tokio::test]
async fn test_table_pinned_to_second_pool() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pinned.db");
    let mut config = CatalogConfig::default();
    config
        .pools
        .push(PoolConfig::new("sql", "sqlite", &path.to_string_lossy()));
    config.tables.insert(
        "tasks".to_string(),
        TableConfig {
            pool: Some("sql".to_string()),
            ..Default::default()
        },
    );
    let catalog = Catalog::new(config).await.unwrap();
    catalog.init().await.unwrap();
    catalog.describe_json(&schema());
    catalog.create_tables(None).await.unwrap();

    catalog
        .put("tasks", record(json!({"id": 1, "status": "active"})), QueryOptions::new())
        .await
        .unwrap();
    let res = catalog
        .query_sql(Some("sql"), "SELECT COUNT(*) AS n FROM tasks", Vec::new())
        .await
        .unwrap();
    assert_eq!(res.rows[0]["n"], json!(1));
    catalog.shutdown().await;
    assert!(catalog.pool_names().is_empty());
}
