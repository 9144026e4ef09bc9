// Query Requests
// Operation options, the per-operation request object and normalized results

use crate::db::schema::TableSchema;
use crate::db::traits::{Op, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Comparison operators usable in select/search conditions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "=", alias = "==")]
    Eq,
    #[serde(alias = "!=", alias = "<>")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    In,
    Between,
    #[serde(alias = "begins")]
    BeginsWith,
    Contains,
    Like,
    Null,
    NotNull,
}

impl CompareOp {
    pub fn parse(text: &str) -> Option<CompareOp> {
        let op = match text.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "eq" | "=" | "==" => CompareOp::Eq,
            "ne" | "!=" | "<>" => CompareOp::Ne,
            "gt" | ">" => CompareOp::Gt,
            "ge" | ">=" => CompareOp::Ge,
            "lt" | "<" => CompareOp::Lt,
            "le" | "<=" => CompareOp::Le,
            "in" => CompareOp::In,
            "between" => CompareOp::Between,
            "begins_with" | "begins" => CompareOp::BeginsWith,
            "contains" => CompareOp::Contains,
            "like" => CompareOp::Like,
            "null" => CompareOp::Null,
            "not_null" => CompareOp::NotNull,
            _ => return None,
        };
        Some(op)
    }

    /// Operators whose value is a list
    pub fn is_list(&self) -> bool {
        matches!(self, CompareOp::In | CompareOp::Between)
    }

    /// Operators that take no value
    pub fn is_unary(&self) -> bool {
        matches!(self, CompareOp::Null | CompareOp::NotNull)
    }
}

/// Predicate applied to every result row, rows for which it returns false are dropped
#[derive(Clone)]
pub struct RowFilter(pub Arc<dyn Fn(&Record) -> bool + Send + Sync>);

impl RowFilter {
    pub fn new(f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, row: &Record) -> bool {
        (self.0)(row)
    }
}

impl fmt::Debug for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RowFilter")
    }
}

/// Per-call options shared by all operations
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit pool, overrides table pinning
    pub pool: Option<String>,
    /// Comparison operator per column
    pub ops: HashMap<String, CompareOp>,
    /// Columns to return
    pub select: Option<Vec<String>>,
    /// Page size
    pub count: Option<usize>,
    /// Resume token from a previous page
    pub start: Option<Value>,
    pub sort: Option<String>,
    pub desc: bool,
    /// Skip schema filtering of input columns
    pub no_columns: bool,
    pub strict_join: bool,
    /// Columns removed from the input before execution
    pub skip_columns: Vec<String>,
    /// Drop null and empty values from the input
    pub skip_null: bool,
    /// Columns incremented by incr in addition to counter-typed ones
    pub counter: Vec<String>,
    /// Deduplicate result rows by this column
    pub unique: Option<String>,
    pub filter: Option<RowFilter>,
    /// Do not log errors
    pub quiet: bool,
    /// Serve get from the cache when possible
    pub cached: bool,
    pub cache_key: Option<String>,
    pub cache_prefix: Option<String>,
    /// Remove secure and admin-only columns from results
    pub cleanup: bool,
    /// Caller is privileged, cleanup keeps admin-only columns
    pub admin: bool,
    /// Return only the first row
    pub first: bool,
    /// Write stored values as they are: no readonly, writeonly, hidden, enumeration or
    /// length rules and no re-stamping of `now` columns. Joins and type coercion still apply.
    pub raw: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(pool.to_string());
        self
    }

    pub fn with_op(mut self, column: &str, op: CompareOp) -> Self {
        self.ops.insert(column.to_string(), op);
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_start(mut self, start: Option<Value>) -> Self {
        self.start = start;
        self
    }

    pub fn with_select(mut self, columns: &[&str]) -> Self {
        self.select = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_sort(mut self, column: &str, desc: bool) -> Self {
        self.sort = Some(column.to_string());
        self.desc = desc;
        self
    }

    pub fn with_filter(mut self, f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(RowFilter::new(f));
        self
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn cleanup(mut self, admin: bool) -> Self {
        self.cleanup = true;
        self.admin = admin;
        self
    }

    /// Operator for a column: explicit option, then the column default
    pub fn op_for(&self, column: &str, schema: &TableSchema) -> CompareOp {
        self.ops
            .get(column)
            .copied()
            .or_else(|| schema.column(column).and_then(|c| c.op))
            .unwrap_or(CompareOp::Eq)
    }
}

/// One native statement with its bound values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub text: String,
    pub values: Vec<Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            values,
        }
    }
}

/// Execution facts reported alongside rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryInfo {
    pub affected_rows: u64,
    pub inserted_oid: Option<Value>,
    pub next_token: Option<Value>,
    pub consumed_capacity: Option<f64>,
    pub elapsed_ms: u64,
}

/// The per-operation object flowing through prepare, execute and post-process
#[derive(Debug, Clone)]
pub struct Request {
    pub op: Op,
    /// Physical table after resolution
    pub table: String,
    /// Logical table as named by the caller
    pub orig_table: String,
    pub pool: String,
    pub schema: Arc<TableSchema>,
    /// Shaped record for single-record operations
    pub record: Record,
    /// Shaped records for list
    pub records: Vec<Record>,
    /// Caller input after pre hooks, before shaping
    pub orig: Record,
    /// Effective comparison operator per condition column
    pub ops: HashMap<String, CompareOp>,
    pub options: QueryOptions,
    /// Native statements built by the pool
    pub statements: Vec<Statement>,
    /// Raw SQL for `Op::Sql`
    pub text: Option<String>,
    pub started: Instant,
    pub info: QueryInfo,
}

impl Request {
    pub fn new(op: Op, table: &str, record: Record, options: QueryOptions) -> Self {
        Self {
            op,
            table: table.to_string(),
            orig_table: table.to_string(),
            pool: String::new(),
            schema: Arc::new(TableSchema::default()),
            orig: record.clone(),
            record,
            records: Vec::new(),
            ops: HashMap::new(),
            options,
            statements: Vec::new(),
            text: None,
            started: Instant::now(),
            info: QueryInfo::default(),
        }
    }

    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.records = records;
        self
    }

    pub fn op_for(&self, column: &str) -> CompareOp {
        self.ops.get(column).copied().unwrap_or(CompareOp::Eq)
    }

    /// Primary key values of the shaped record, None when any is missing
    pub fn key_values(&self) -> Option<Vec<Value>> {
        self.schema
            .keys
            .iter()
            .map(|k| self.record.get(k).filter(|v| !v.is_null()).cloned())
            .collect()
    }
}

/// Rows plus execution info
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub info: QueryInfo,
}

impl QueryResult {
    pub fn first(&self) -> Option<&Record> {
        self.rows.first()
    }

    pub fn into_first(self) -> Option<Record> {
        self.rows.into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compare_ops() {
        assert_eq!(CompareOp::parse(">="), Some(CompareOp::Ge));
        assert_eq!(CompareOp::parse("begins with"), Some(CompareOp::BeginsWith));
        assert_eq!(CompareOp::parse("NOT NULL"), Some(CompareOp::NotNull));
        assert_eq!(CompareOp::parse("around"), None);
        assert!(CompareOp::Between.is_list());
        assert!(CompareOp::Null.is_unary());
    }

    #[test]
    fn test_deserialize_symbol_alias() {
        let op: CompareOp = serde_json::from_str("\">\"").unwrap();
        assert_eq!(op, CompareOp::Gt);
        let op: CompareOp = serde_json::from_str("\"begins_with\"").unwrap();
        assert_eq!(op, CompareOp::BeginsWith);
    }

    #[test]
    fn test_filter_option() {
        let options = QueryOptions::new().with_filter(|r| r.contains_key("id"));
        let mut row = Record::new();
        assert!(!options.filter.as_ref().unwrap().matches(&row));
        row.insert("id".into(), Value::from(1));
        assert!(options.filter.as_ref().unwrap().matches(&row));
    }
}
