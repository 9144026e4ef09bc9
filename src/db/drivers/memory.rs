// Memory Driver
// Key-value pool held in process memory, with item-level paging and provisioned capacity

use crate::db::config::PoolConfig;
use crate::db::request::{CompareOp, Request};
use crate::db::traits::{
    ColumnInfo, DbError, DbResult, NativeResult, Op, Pool, PoolBase, PoolClient, PoolDriver,
    PoolSettings, Record,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

pub const CONDITION_FAILED: &str = "ConditionalCheckFailedException";
pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";

/// Primary key values with a total order across JSON types
#[derive(Debug, Clone)]
pub struct ItemKey(pub Vec<Value>);

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two JSON values: numbers numerically, strings lexically, other types by kind
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if type_rank(a) != type_rank(b) => type_rank(a).cmp(&type_rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

impl Ord for ItemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match compare_values(a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for ItemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ItemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ItemKey {}

#[derive(Debug, Default)]
struct MemTable {
    keys: Vec<String>,
    items: BTreeMap<ItemKey, Record>,
}

impl MemTable {
    fn key_of(&self, record: &Record) -> DbResult<ItemKey> {
        self.keys
            .iter()
            .map(|k| {
                record
                    .get(k)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .ok_or_else(|| DbError::Validation(format!("missing primary key {}", k)))
            })
            .collect::<DbResult<Vec<_>>>()
            .map(ItemKey)
    }
}

/// Evaluate one condition against a stored item
pub fn matches_condition(row: &Record, column: &str, op: CompareOp, value: &Value) -> bool {
    let field = row.get(column).unwrap_or(&Value::Null);
    match op {
        CompareOp::Null => field.is_null(),
        CompareOp::NotNull => !field.is_null(),
        CompareOp::Eq => compare_values(field, value) == Ordering::Equal,
        CompareOp::Ne => compare_values(field, value) != Ordering::Equal,
        _ if field.is_null() => false,
        CompareOp::Gt => compare_values(field, value) == Ordering::Greater,
        CompareOp::Ge => compare_values(field, value) != Ordering::Less,
        CompareOp::Lt => compare_values(field, value) == Ordering::Less,
        CompareOp::Le => compare_values(field, value) != Ordering::Greater,
        CompareOp::In => match value {
            Value::Array(items) => items
                .iter()
                .any(|v| compare_values(field, v) == Ordering::Equal),
            other => compare_values(field, other) == Ordering::Equal,
        },
        CompareOp::Between => match value.as_array().map(|a| a.as_slice()) {
            Some([low, high]) => {
                compare_values(field, low) != Ordering::Less
                    && compare_values(field, high) != Ordering::Greater
            }
            _ => false,
        },
        CompareOp::BeginsWith => match (field, value) {
            (Value::String(s), Value::String(p)) => s.starts_with(p.as_str()),
            (f, p) => f.to_string().starts_with(&p.to_string()),
        },
        CompareOp::Contains => match (field, value) {
            (Value::String(s), Value::String(p)) => s.contains(p.as_str()),
            (Value::Array(items), v) => items.iter().any(|i| compare_values(i, v) == Ordering::Equal),
            _ => false,
        },
        CompareOp::Like => match (field, value) {
            (Value::String(s), Value::String(p)) => like(s.as_bytes(), p.as_bytes()),
            _ => false,
        },
    }
}

/// SQL LIKE with `%` and `_` wildcards
fn like(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'%', rest)) => (0..=text.len()).any(|i| like(&text[i..], rest)),
        Some((b'_', rest)) => !text.is_empty() && like(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like(&text[1..], rest),
    }
}

/// Checked out handle; all state lives in the pool
pub struct MemoryClient {
    id: String,
}

#[async_trait::async_trait]
impl PoolClient for MemoryClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// In-process key-value pool
pub struct MemoryPool {
    base: PoolBase,
    tables: Mutex<HashMap<String, MemTable>>,
    clients: AtomicU64,
}

impl MemoryPool {
    pub fn new(config: PoolConfig) -> Self {
        let settings = PoolSettings::from_config(&config, false, true);
        Self {
            base: PoolBase::new(config, settings),
            tables: Mutex::new(HashMap::new()),
            clients: AtomicU64::new(0),
        }
    }

    fn missing(table: &str) -> DbError {
        DbError::Native {
            code: RESOURCE_NOT_FOUND.to_string(),
            message: format!("Requested resource not found: {}", table),
        }
    }

    fn project(request: &Request, row: &Record) -> Record {
        match &request.options.select {
            Some(cols) if !cols.is_empty() => row
                .iter()
                .filter(|(k, _)| cols.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => row.clone(),
        }
    }

    fn write(&self, request: &Request) -> DbResult<NativeResult> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&request.table)
            .ok_or_else(|| Self::missing(&request.table))?;
        let key = table.key_of(&request.record)?;
        let mut result = NativeResult {
            consumed_capacity: Some(1.0),
            ..Default::default()
        };
        match request.op {
            Op::Add => {
                if table.items.contains_key(&key) {
                    return Err(DbError::Native {
                        code: CONDITION_FAILED.to_string(),
                        message: "The conditional request failed".to_string(),
                    });
                }
                table.items.insert(key, request.record.clone());
                result.affected_rows = Some(1);
            }
            Op::Put => {
                table.items.insert(key, request.record.clone());
                result.affected_rows = Some(1);
            }
            Op::Update | Op::Incr => {
                let Some(item) = table.items.get_mut(&key) else {
                    result.affected_rows = Some(0);
                    return Ok(result);
                };
                for (column, value) in &request.record {
                    let counter = request.op == Op::Incr
                        && !table.keys.contains(column)
                        && value.is_number()
                        && (request.options.counter.contains(column)
                            || request.schema.column(column).map_or(false, |c| {
                                c.col_type() == crate::db::schema::ColumnType::Counter
                            }));
                    if counter {
                        let current = item.get(column).and_then(Value::as_f64).unwrap_or(0.0);
                        let delta = value.as_f64().unwrap_or(0.0);
                        item.insert(column.clone(), number(current + delta));
                    } else {
                        item.insert(column.clone(), value.clone());
                    }
                }
                result.affected_rows = Some(1);
            }
            Op::Del => {
                let removed = table.items.remove(&key).is_some();
                result.affected_rows = Some(removed as u64);
            }
            _ => {}
        }
        Ok(result)
    }

    fn read(&self, request: &Request) -> DbResult<NativeResult> {
        let tables = self.tables.lock();
        let table = tables
            .get(&request.table)
            .ok_or_else(|| Self::missing(&request.table))?;
        let mut result = NativeResult::default();

        match request.op {
            Op::Get => {
                let key = table.key_of(&request.record)?;
                if let Some(row) = table.items.get(&key) {
                    result.rows.push(Self::project(request, row));
                }
                result.consumed_capacity = Some(1.0);
            }
            Op::List => {
                for record in &request.records {
                    let key = table.key_of(record)?;
                    if let Some(row) = table.items.get(&key) {
                        result.rows.push(Self::project(request, row));
                    }
                }
                result.consumed_capacity = Some(request.records.len() as f64);
            }
            _ => self.scan(request, table, &mut result),
        }
        Ok(result)
    }

    fn scan(&self, request: &Request, table: &MemTable, result: &mut NativeResult) {
        let matches = |row: &Record| {
            request
                .record
                .iter()
                .all(|(c, v)| matches_condition(row, c, request.op_for(c), v))
        };
        let count = request.options.count.unwrap_or(usize::MAX);
        let mut examined = 0usize;

        if let Some(sort) = &request.options.sort {
            // Sorted scans page by offset
            let mut rows: Vec<&Record> = table.items.values().filter(|r| matches(r)).collect();
            examined = table.items.len();
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(sort).unwrap_or(&Value::Null),
                    b.get(sort).unwrap_or(&Value::Null),
                );
                if request.options.desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
            let offset = request
                .options
                .start
                .as_ref()
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let page: Vec<Record> = rows
                .iter()
                .skip(offset)
                .take(count)
                .map(|r| Self::project(request, r))
                .collect();
            if offset + page.len() < rows.len() {
                result.more = true;
                result.next_token = Some(Value::from((offset + page.len()) as u64));
            }
            result.rows = page;
        } else {
            let start = request.options.start.as_ref().and_then(|s| match s {
                Value::Array(items) => Some(ItemKey(items.clone())),
                _ => None,
            });
            let range: Box<dyn Iterator<Item = (&ItemKey, &Record)> + '_> = match (&start, request.options.desc) {
                (Some(start), false) => Box::new(
                    table
                        .items
                        .range((std::ops::Bound::Excluded(start.clone()), std::ops::Bound::Unbounded)),
                ),
                (Some(start), true) => Box::new(
                    table
                        .items
                        .range((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(start.clone())))
                        .rev(),
                ),
                (None, false) => Box::new(table.items.iter()),
                (None, true) => Box::new(table.items.iter().rev()),
            };
            let mut last_key = None;
            for (key, row) in range {
                examined += 1;
                if !matches(row) {
                    continue;
                }
                if result.rows.len() >= count {
                    result.more = true;
                    break;
                }
                result.rows.push(Self::project(request, row));
                last_key = Some(key);
            }
            if result.more {
                result.next_token = last_key.map(|k| Value::Array(k.0.clone()));
            }
        }
        result.consumed_capacity = Some(examined.max(1) as f64);
    }

    fn ddl(&self, request: &Request) -> DbResult<NativeResult> {
        let mut tables = self.tables.lock();
        match request.op {
            Op::Create | Op::Upgrade => {
                let entry = tables.entry(request.table.clone()).or_default();
                if entry.items.is_empty() || entry.keys.is_empty() {
                    entry.keys = request.schema.keys.clone();
                }
            }
            Op::Drop => {
                tables.remove(&request.table);
            }
            _ => {}
        }
        Ok(NativeResult::default())
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[async_trait::async_trait]
impl Pool for MemoryPool {
    fn base(&self) -> &PoolBase {
        &self.base
    }

    fn pool_type(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> DbResult<Box<dyn PoolClient>> {
        let n = self.clients.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Box::new(MemoryClient {
            id: format!("{}-{}", self.name(), n),
        }))
    }

    fn prepare(&self, _request: &mut Request) -> DbResult<()> {
        Ok(())
    }

    async fn query(&self, client: &dyn PoolClient, request: &Request) -> DbResult<NativeResult> {
        client
            .as_any()
            .downcast_ref::<MemoryClient>()
            .ok_or_else(|| DbError::ConnectionFailed("Invalid memory client".to_string()))?;
        match request.op {
            Op::Add | Op::Put | Op::Update | Op::Incr | Op::Del => self.write(request),
            Op::Get | Op::List | Op::Select | Op::Search => self.read(request),
            Op::Create | Op::Upgrade | Op::Drop => self.ddl(request),
            Op::Sql => Err(DbError::Validation(
                "memory pool does not execute SQL".to_string(),
            )),
        }
    }

    fn convert_error(&self, table: &str, _op: Op, err: DbError) -> DbError {
        match err {
            DbError::Native { code, message } if code == CONDITION_FAILED => {
                DbError::AlreadyExists(format!("{}: {}", table, message))
            }
            DbError::Native { code, message } if code == RESOURCE_NOT_FOUND => {
                DbError::NotFound(message)
            }
            other => other,
        }
    }

    async fn cache_columns(&self) -> DbResult<()> {
        let snapshot: Vec<(String, Vec<String>, HashMap<String, ColumnInfo>)> = {
            let tables = self.tables.lock();
            tables
                .iter()
                .map(|(name, table)| {
                    let mut columns = HashMap::new();
                    for row in table.items.values() {
                        for (column, value) in row {
                            let position = columns.len() as i32;
                            columns.entry(column.clone()).or_insert_with(|| ColumnInfo {
                                name: column.clone(),
                                data_type: json_type(value).to_string(),
                                is_nullable: !table.keys.contains(column),
                                is_primary_key: table.keys.contains(column),
                                column_default: None,
                                ordinal_position: position,
                            });
                        }
                    }
                    (name.clone(), table.keys.clone(), columns)
                })
                .collect()
        };
        let mut meta = self.metadata().write();
        meta.dbcolumns.clear();
        meta.dbkeys.clear();
        for (name, keys, columns) in snapshot {
            meta.dbkeys.insert(name.clone(), keys);
            meta.dbcolumns.insert(name, columns);
        }
        Ok(())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "obj",
    }
}

/// Driver for the in-memory pool
pub struct MemoryDriver;

#[async_trait::async_trait]
impl PoolDriver for MemoryDriver {
    fn pool_type(&self) -> &'static str {
        "memory"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["mem"]
    }

    async fn create_pool(&self, config: &PoolConfig) -> DbResult<Arc<dyn Pool>> {
        Ok(Arc::new(MemoryPool::new(config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::request::QueryOptions;
    use crate::db::schema::SchemaRegistry;
    use serde_json::json;

    fn request(op: Op, record: Value, options: QueryOptions) -> Request {
        let registry = SchemaRegistry::new();
        registry.describe_json(&json!({"t": {"id": {"type": "int", "primary": 1}, "n": {"type": "counter"}}}));
        let mut req = Request::new(op, "t", record.as_object().cloned().unwrap_or_default(), options);
        req.schema = registry.get_table("t").unwrap();
        req.ops = req.options.ops.clone();
        req
    }

    async fn run(pool: &MemoryPool, req: Request) -> DbResult<NativeResult> {
        let client = pool.open().await?;
        pool.query(client.as_ref(), &req)
            .await
            .map_err(|e| pool.convert_error("t", req.op, e))
    }

    #[test]
    fn test_key_order_is_numeric() {
        assert!(ItemKey(vec![json!(9)]) < ItemKey(vec![json!(10)]));
        assert!(ItemKey(vec![json!("a"), json!(2)]) < ItemKey(vec![json!("a"), json!(11)]));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like(b"hello", b"h%o"));
        assert!(like(b"hello", b"_ello"));
        assert!(!like(b"hello", b"h_o"));
    }

    #[tokio::test]
    async fn test_missing_table_is_not_found() {
        let pool = MemoryPool::new(PoolConfig::new("m", "memory", ""));
        let err = run(&pool, request(Op::Get, json!({"id": 1}), QueryOptions::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_twice_already_exists() {
        let pool = MemoryPool::new(PoolConfig::new("m", "memory", ""));
        run(&pool, request(Op::Create, json!({}), QueryOptions::new())).await.unwrap();
        run(&pool, request(Op::Add, json!({"id": 1}), QueryOptions::new())).await.unwrap();
        let err = run(&pool, request(Op::Add, json!({"id": 1}), QueryOptions::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_scan_paging_with_exclusive_start() {
        let pool = MemoryPool::new(PoolConfig::new("m", "memory", ""));
        run(&pool, request(Op::Create, json!({}), QueryOptions::new())).await.unwrap();
        for id in 1..=5 {
            run(&pool, request(Op::Put, json!({"id": id}), QueryOptions::new())).await.unwrap();
        }
        let page = run(&pool, request(Op::Select, json!({}), QueryOptions::new().with_count(2)))
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.next_token, Some(json!([2])));

        let rest = run(
            &pool,
            request(Op::Select, json!({}), QueryOptions::new().with_count(5).with_start(page.next_token)),
        )
        .await
        .unwrap();
        assert_eq!(rest.rows.len(), 3);
        assert_eq!(rest.rows[0]["id"], json!(3));
        assert!(rest.next_token.is_none());
    }

    #[tokio::test]
    async fn test_incr_adds_to_counter() {
        let pool = MemoryPool::new(PoolConfig::new("m", "memory", ""));
        run(&pool, request(Op::Create, json!({}), QueryOptions::new())).await.unwrap();
        run(&pool, request(Op::Put, json!({"id": 1, "n": 1}), QueryOptions::new())).await.unwrap();
        run(&pool, request(Op::Incr, json!({"id": 1, "n": 2}), QueryOptions::new())).await.unwrap();
        let row = run(&pool, request(Op::Get, json!({"id": 1}), QueryOptions::new()))
            .await
            .unwrap();
        assert_eq!(row.rows[0]["n"], json!(3));
    }
}
