// Request Preparer
// Resolves the pool and shapes caller records against the table schema before execution

use crate::db::catalog::Catalog;
use crate::db::request::{CompareOp, QueryOptions, Request};
use crate::db::schema::{ColumnDef, ColumnType, TableSchema};
use crate::db::traits::{DbError, DbResult, Op, PoolSettings, Record};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Columns starting with this marker are private to the caller and never stored
pub const PRIVATE_MARKER: char = '_';

/// Coerce a value to a declared column type; unparsable numbers become 0
pub fn coerce_value(value: &Value, col_type: ColumnType) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match col_type {
        t if t.is_integer() => Value::from(to_i64(value)),
        ColumnType::Real | ColumnType::Double => float(to_f64(value)),
        ColumnType::Bool => Value::Bool(to_bool(value)),
        ColumnType::Date => match value {
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map_or_else(|| value.clone(), |dt| Value::String(dt.to_rfc3339())),
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        },
        t if t.is_json() => match value {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
            other => other.clone(),
        },
        ColumnType::Blob | ColumnType::Other => value.clone(),
        _ => Value::String(text(value)),
    }
}

fn to_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::Bool(b) => *b as i64,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => *b as i64 as f64,
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y" | "on"
        ),
        _ => false,
    }
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Plain text form of a value, strings are not quoted
pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Private, explicitly skipped and (with `skip_null`) empty columns never reach the backend
fn is_skipped(name: &str, value: &Value, options: &QueryOptions) -> bool {
    name.starts_with(PRIVATE_MARKER)
        || options.skip_columns.iter().any(|c| c == name)
        || (options.skip_null && is_empty(value))
}

fn normalize_case(value: Value, col: &ColumnDef) -> Value {
    match value {
        Value::String(s) if col.lower.unwrap_or(false) => Value::String(s.to_lowercase()),
        Value::String(s) if col.upper.unwrap_or(false) => Value::String(s.to_uppercase()),
        other => other,
    }
}

/// Timestamp for `now` columns in the column's representation
fn now_value(col: &ColumnDef) -> Value {
    let now = Utc::now();
    if col.col_type().is_integer() {
        Value::from(now.timestamp_millis())
    } else {
        Value::String(now.to_rfc3339())
    }
}

/// Recompute every join column of the schema from its constituents
///
/// Constituent values come from the caller's input (after pre hooks) so a joined
/// value already present in the input is never joined a second time; shaped values
/// fill in constituents the caller did not pass, such as generated defaults.
fn apply_joins(schema: &TableSchema, input: &Record, shaped: &mut Record, separator: &str, options: &QueryOptions) {
    for (name, col) in &schema.columns {
        let Some(parts) = &col.join else {
            continue;
        };
        let values: Vec<Option<&Value>> = parts
            .iter()
            .map(|p| input.get(p).or_else(|| shaped.get(p)))
            .collect();
        if values.iter().all(|v| v.is_none()) {
            continue;
        }
        let strict = options.strict_join || col.strict_join.unwrap_or(false);
        if strict && values.iter().any(|v| v.map_or(true, is_empty)) {
            continue;
        }
        let sep = col.separator.as_deref().unwrap_or(separator);
        let joined = values
            .iter()
            .map(|v| v.map(text).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(sep);
        shaped.insert(name.clone(), Value::String(joined));
    }
}

/// Shaping rules shared by the per-op routines
struct Shaper<'a> {
    op: Op,
    schema: &'a TableSchema,
    options: &'a QueryOptions,
    settings: &'a PoolSettings,
    separator: &'a str,
}

impl Shaper<'_> {
    fn strict(&self, col: &ColumnDef, value: &Value) -> Value {
        if self.settings.strict_types && (col.is_typed() || col.is_primary()) {
            coerce_value(value, col.col_type())
        } else {
            value.clone()
        }
    }

    /// Objects and arrays go to the backend as JSON text unless it stores them natively
    fn encode(&self, value: Value) -> Value {
        match value {
            Value::Object(_) | Value::Array(_) if !self.settings.native_json => {
                Value::String(value.to_string())
            }
            other => other,
        }
    }

    fn keeps_unknown(&self) -> bool {
        self.schema.is_empty() || self.options.no_columns
    }

    /// add/put/incr/update
    fn update(&self, input: &Record) -> Record {
        let mut out = Record::new();
        for (name, value) in input {
            if is_skipped(name, value, self.options) {
                continue;
            }
            let Some(col) = self.schema.column(name) else {
                if self.keeps_unknown() {
                    out.insert(name.clone(), self.encode(value.clone()));
                }
                continue;
            };
            let v = self.strict(col, value);
            if self.options.raw {
                out.insert(name.clone(), self.encode(v));
                continue;
            }
            if col.is_hidden() {
                continue;
            }
            if col.is_readonly() && matches!(self.op, Op::Update | Op::Incr) {
                continue;
            }
            if col.is_writeonly() && matches!(self.op, Op::Add | Op::Put) {
                continue;
            }
            if let Some(allowed) = &col.values {
                if !v.is_null() && !allowed.contains(&v) {
                    tracing::debug!(table = %self.schema.name, column = %name, "Value not in enumeration, dropped");
                    continue;
                }
            }
            let mut v = normalize_case(v, col);
            if let (Some(max), Value::String(s)) = (col.maxlength, &v) {
                if s.chars().count() > max {
                    v = Value::String(s.chars().take(max).collect());
                }
            }
            out.insert(name.clone(), self.encode(v));
        }

        if matches!(self.op, Op::Add | Op::Put) {
            self.fill_defaults(&mut out);
        }
        apply_joins(self.schema, input, &mut out, self.separator, self.options);
        out
    }

    fn fill_defaults(&self, out: &mut Record) {
        for (name, col) in &self.schema.columns {
            if col.is_hidden() || col.join.is_some() {
                continue;
            }
            let now = col.now.unwrap_or(false);
            // Non-primary `now` columns are stamped even when the caller passed a value
            let restamp = now && !col.is_primary() && !self.options.raw;
            if out.contains_key(name) && !restamp {
                continue;
            }
            let value = if restamp {
                now_value(col)
            } else if let Some(value) = &col.value {
                self.encode(value.clone())
            } else if now {
                if self.op != Op::Add {
                    continue;
                }
                now_value(col)
            } else {
                match col.col_type {
                    Some(ColumnType::Uuid) => Value::String(uuid::Uuid::new_v4().to_string()),
                    Some(ColumnType::Counter) => Value::from(0),
                    _ => continue,
                }
            };
            out.insert(name.clone(), value);
        }
    }

    /// del: only typed and primary columns are coerced
    fn delete(&self, input: &Record) -> Record {
        let mut out = Record::new();
        for (name, value) in input {
            if is_skipped(name, value, self.options) {
                continue;
            }
            match self.schema.column(name) {
                Some(col) => {
                    out.insert(name.clone(), self.strict(col, value));
                }
                None if self.keeps_unknown() => {
                    out.insert(name.clone(), value.clone());
                }
                None => {}
            }
        }
        apply_joins(self.schema, input, &mut out, self.separator, self.options);
        out
    }

    /// Query conditions for get/select/search; fills the effective operator per column
    fn conditions(&self, input: &Record, ops: &mut std::collections::HashMap<String, CompareOp>) -> Record {
        let mut out = Record::new();
        for (name, value) in input {
            if is_skipped(name, value, self.options) {
                continue;
            }
            let col = self.schema.column(name);
            if col.is_none() && !self.keeps_unknown() {
                continue;
            }
            let op = self.options.op_for(name, self.schema);
            let mut v = if op.is_list() { expand_list(value) } else { value.clone() };
            if let Some(col) = col {
                v = self.condition_value(col, op, v);
            }
            out.insert(name.clone(), v);
            ops.insert(name.clone(), op);
        }

        let before: Vec<String> = out.keys().cloned().collect();
        apply_joins(self.schema, input, &mut out, self.separator, self.options);
        for name in out.keys() {
            if !before.contains(name) {
                ops.insert(name.clone(), self.options.op_for(name, self.schema));
            }
        }
        out
    }

    /// Textual numerics and booleans become native values when the pool is strict
    fn condition_value(&self, col: &ColumnDef, op: CompareOp, value: Value) -> Value {
        let numeric = col.col_type().is_numeric() || col.col_type() == ColumnType::Bool;
        let textual_op = matches!(op, CompareOp::BeginsWith | CompareOp::Contains | CompareOp::Like);
        let value = match value {
            Value::Array(items) if self.settings.strict_types && numeric && !textual_op => Value::Array(
                items
                    .iter()
                    .map(|v| if v.is_string() { coerce_value(v, col.col_type()) } else { v.clone() })
                    .collect(),
            ),
            Value::String(_) if self.settings.strict_types && numeric && !textual_op => {
                coerce_value(&value, col.col_type())
            }
            other => other,
        };
        match value {
            Value::Array(items) => Value::Array(items.into_iter().map(|v| normalize_case(v, col)).collect()),
            other => normalize_case(other, col),
        }
    }

    /// list: coerce, join, then keep only the primary key of each row
    fn list_row(&self, input: &Record) -> Option<Record> {
        let mut out = Record::new();
        for (name, value) in input {
            if is_skipped(name, value, self.options) {
                continue;
            }
            if let Some(col) = self.schema.column(name) {
                out.insert(name.clone(), self.strict(col, value));
            } else {
                out.insert(name.clone(), value.clone());
            }
        }
        apply_joins(self.schema, input, &mut out, self.separator, self.options);
        if self.schema.keys.is_empty() {
            return Some(out);
        }
        out.retain(|name, _| self.schema.is_key(name));
        self.schema
            .keys
            .iter()
            .all(|k| out.get(k).map_or(false, |v| !v.is_null()))
            .then_some(out)
    }
}

/// `in`/`between` accept arrays, comma separated strings or a single scalar
fn expand_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        Value::String(s) => Value::Array(
            s.split(',')
                .map(|p| Value::String(p.trim().to_string()))
                .filter(|v| !is_empty(v))
                .collect(),
        ),
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other.clone()]),
    }
}

impl Catalog {
    /// Build a ready-to-execute request for a single-record operation
    pub fn prepare(&self, op: Op, table: &str, record: Record, options: QueryOptions) -> DbResult<Request> {
        self.prepare_request(Request::new(op, table, record, options))
    }

    /// Build a multi-key point lookup
    pub fn prepare_list(&self, table: &str, records: Vec<Record>, options: QueryOptions) -> DbResult<Request> {
        self.prepare_request(Request::new(Op::List, table, Record::new(), options).with_records(records))
    }

    pub(crate) fn prepare_request(&self, mut req: Request) -> DbResult<Request> {
        let table = req.orig_table.clone();
        let pool = self.pool_for_table(&table, req.options.pool.as_deref())?;
        req.pool = pool.name().to_string();
        req.table = pool.resolve_table(req.op, &table, &req.orig, &req.options);
        req.schema = self.schema().table_or_empty(&table);

        // Hooks see a copy, the caller's record stays untouched
        let mut input = std::mem::take(&mut req.record);
        self.run_pre_hooks(&req, &mut input);
        req.orig = input.clone();

        let settings = pool.settings().clone();
        let tc = self.table_config(&table);
        let shaper = Shaper {
            op: req.op,
            schema: &req.schema,
            options: &req.options,
            settings: &settings,
            separator: tc.separator(),
        };

        match req.op {
            Op::Add | Op::Put | Op::Incr | Op::Update => {
                req.record = shaper.update(&input);
            }
            Op::Del => {
                req.record = shaper.delete(&input);
            }
            Op::Get | Op::Select | Op::Search => {
                let mut ops = std::collections::HashMap::new();
                let record = shaper.conditions(&input, &mut ops);
                if req.op == Op::Search {
                    search_prefix(&req.schema, &req.options, &record, &mut ops);
                }
                req.record = record;
                req.ops = ops;
            }
            Op::List => {
                let rows: Vec<Record> = req.records.iter().filter_map(|r| shaper.list_row(r)).collect();
                if rows.len() < req.records.len() {
                    tracing::debug!(
                        table = %table,
                        dropped = req.records.len() - rows.len(),
                        "List rows without a full primary key dropped"
                    );
                }
                req.records = rows;
            }
            Op::Create | Op::Upgrade | Op::Drop | Op::Sql => {
                req.record = input;
            }
        }

        if req.op.needs_keys() {
            check_keys(&req)?;
        }
        pool.prepare(&mut req)?;
        Ok(req)
    }
}

/// search: the first key column present (else the first condition) matches by prefix
fn search_prefix(
    schema: &TableSchema,
    options: &QueryOptions,
    record: &Record,
    ops: &mut std::collections::HashMap<String, CompareOp>,
) {
    let column = schema
        .keys
        .iter()
        .find(|k| record.contains_key(*k))
        .or_else(|| record.keys().next());
    if let Some(column) = column {
        if !options.ops.contains_key(column) {
            ops.insert(column.clone(), CompareOp::BeginsWith);
        }
    }
}

fn check_keys(req: &Request) -> DbResult<()> {
    if req.schema.keys.is_empty() {
        return Err(DbError::Validation(format!(
            "{}: table {} has no primary key",
            req.op, req.orig_table
        )));
    }
    for key in &req.schema.keys {
        if req.record.get(key).map_or(true, Value::is_null) {
            return Err(DbError::Validation(format!(
                "{}: missing primary key {} for table {}",
                req.op, key, req.orig_table
            )));
        }
    }
    Ok(())
}
