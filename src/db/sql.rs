// SQL Statement Builder
// Renders prepared requests into parameterized statements for the SQL backends

use crate::db::request::{CompareOp, Request, Statement};
use crate::db::schema::{ColumnDef, ColumnType, TableSchema};
use crate::db::traits::{DbError, DbResult, NativeResult, Op, Record};
use serde_json::Value;
use std::collections::HashSet;

/// Placeholder and type dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStyle {
    Sqlite,
    Postgres,
}

impl SqlStyle {
    pub fn quote(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Native column type for DDL
    pub fn column_type(&self, def: &ColumnDef) -> &'static str {
        let t = def.col_type();
        match self {
            SqlStyle::Sqlite => match t {
                t if t.is_integer() => "INTEGER",
                ColumnType::Bool => "INTEGER",
                ColumnType::Real | ColumnType::Double => "REAL",
                ColumnType::Blob => "BLOB",
                _ => "TEXT",
            },
            SqlStyle::Postgres => match t {
                ColumnType::Int => "INTEGER",
                ColumnType::Smallint => "SMALLINT",
                ColumnType::Bigint | ColumnType::Counter | ColumnType::Mtime => "BIGINT",
                ColumnType::Real => "REAL",
                ColumnType::Double => "DOUBLE PRECISION",
                ColumnType::Bool => "BOOLEAN",
                ColumnType::Date => "TIMESTAMPTZ",
                ColumnType::Json | ColumnType::Obj | ColumnType::Array => "JSONB",
                ColumnType::Blob => "BYTEA",
                _ => "TEXT",
            },
        }
    }

    fn substr(&self) -> &'static str {
        "SUBSTR"
    }

    fn position(&self, column: &str, placeholder: &str) -> String {
        match self {
            SqlStyle::Sqlite => format!("INSTR({}, {}) > 0", column, placeholder),
            SqlStyle::Postgres => format!("STRPOS({}::text, {}) > 0", column, placeholder),
        }
    }
}

/// Accumulates bound values while rendering one statement
struct Binder {
    style: SqlStyle,
    values: Vec<Value>,
}

impl Binder {
    fn new(style: SqlStyle) -> Self {
        Self {
            style,
            values: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        match self.style {
            SqlStyle::Sqlite => "?".to_string(),
            SqlStyle::Postgres => format!("${}", self.values.len()),
        }
    }

    fn finish(self, text: String) -> Statement {
        Statement::new(text, self.values)
    }
}

/// Build the native statements for a prepared request
pub fn build(style: SqlStyle, request: &Request, existing: &HashSet<String>) -> DbResult<Vec<Statement>> {
    match request.op {
        Op::Select | Op::Search => Ok(vec![select(style, request)?]),
        Op::Get => Ok(vec![get(style, request)?]),
        Op::List => Ok(list(style, request).into_iter().collect()),
        Op::Add => Ok(vec![insert(style, request, false)]),
        Op::Put => Ok(vec![insert(style, request, true)]),
        Op::Update | Op::Incr => Ok(update(style, request)?.into_iter().collect()),
        Op::Del => Ok(vec![delete(style, request)?]),
        Op::Create => Ok(create_table(style, &request.schema)),
        Op::Upgrade => Ok(upgrade_table(style, &request.schema, existing)),
        Op::Drop => Ok(vec![Statement::new(
            format!("DROP TABLE IF EXISTS {}", style.quote(&request.table)),
            Vec::new(),
        )]),
        Op::Sql => Ok(request.statements.clone()),
    }
}

fn condition(binder: &mut Binder, column: &str, op: CompareOp, value: &Value) -> DbResult<String> {
    let style = binder.style;
    let col = style.quote(column);
    let cond = match op {
        CompareOp::Null => format!("{} IS NULL", col),
        CompareOp::NotNull => format!("{} IS NOT NULL", col),
        CompareOp::Eq if value.is_null() => format!("{} IS NULL", col),
        CompareOp::Ne if value.is_null() => format!("{} IS NOT NULL", col),
        CompareOp::Eq => format!("{} = {}", col, binder.bind(value.clone())),
        CompareOp::Ne => format!("{} <> {}", col, binder.bind(value.clone())),
        CompareOp::Gt => format!("{} > {}", col, binder.bind(value.clone())),
        CompareOp::Ge => format!("{} >= {}", col, binder.bind(value.clone())),
        CompareOp::Lt => format!("{} < {}", col, binder.bind(value.clone())),
        CompareOp::Le => format!("{} <= {}", col, binder.bind(value.clone())),
        CompareOp::Like => format!("{} LIKE {}", col, binder.bind(value.clone())),
        CompareOp::In => {
            let items = as_list(value);
            if items.is_empty() {
                return Ok("1 = 0".to_string());
            }
            let placeholders: Vec<String> = items.into_iter().map(|v| binder.bind(v)).collect();
            format!("{} IN ({})", col, placeholders.join(", "))
        }
        CompareOp::Between => {
            let items = as_list(value);
            if items.len() != 2 {
                return Err(DbError::Validation(format!(
                    "between on {} requires two values",
                    column
                )));
            }
            let mut items = items.into_iter();
            let low = binder.bind(items.next().unwrap_or(Value::Null));
            let high = binder.bind(items.next().unwrap_or(Value::Null));
            format!("{} BETWEEN {} AND {}", col, low, high)
        }
        CompareOp::BeginsWith => {
            let prefix = text_of(value);
            let len = prefix.chars().count();
            format!(
                "{}({}, 1, {}) = {}",
                style.substr(),
                col,
                len,
                binder.bind(Value::String(prefix))
            )
        }
        CompareOp::Contains => {
            let placeholder = binder.bind(Value::String(text_of(value)));
            style.position(&col, &placeholder)
        }
    };
    Ok(cond)
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn where_clause(binder: &mut Binder, request: &Request, record: &Record) -> DbResult<String> {
    let mut conds = Vec::new();
    for (column, value) in record {
        conds.push(condition(binder, column, request.op_for(column), value)?);
    }
    Ok(if conds.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conds.join(" AND "))
    })
}

fn column_list(style: SqlStyle, request: &Request) -> String {
    match &request.options.select {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .map(|c| style.quote(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    }
}

/// Offset encoded in a resume token
pub fn start_offset(request: &Request) -> u64 {
    request
        .options
        .start
        .as_ref()
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0)
}

fn select(style: SqlStyle, request: &Request) -> DbResult<Statement> {
    let mut binder = Binder::new(style);
    let mut text = format!(
        "SELECT {} FROM {}",
        column_list(style, request),
        style.quote(&request.table)
    );
    text.push_str(&where_clause(&mut binder, request, &request.record)?);

    let order: Vec<String> = match &request.options.sort {
        Some(sort) => vec![sort.clone()],
        None => request.schema.keys.clone(),
    };
    if !order.is_empty() {
        let dir = if request.options.desc { " DESC" } else { "" };
        let order: Vec<String> = order
            .iter()
            .map(|c| format!("{}{}", style.quote(c), dir))
            .collect();
        text.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    let offset = start_offset(request);
    match (request.options.count, style) {
        // One extra row tells whether another page exists
        (Some(count), _) => text.push_str(&format!(" LIMIT {}", count + 1)),
        (None, SqlStyle::Sqlite) if offset > 0 => text.push_str(" LIMIT -1"),
        _ => {}
    }
    if offset > 0 {
        text.push_str(&format!(" OFFSET {}", offset));
    }
    Ok(binder.finish(text))
}

fn key_record(request: &Request, record: &Record) -> Record {
    if request.schema.keys.is_empty() {
        return record.clone();
    }
    request
        .schema
        .keys
        .iter()
        .filter_map(|k| record.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

fn get(style: SqlStyle, request: &Request) -> DbResult<Statement> {
    let mut binder = Binder::new(style);
    let mut text = format!(
        "SELECT {} FROM {}",
        column_list(style, request),
        style.quote(&request.table)
    );
    let keys = key_record(request, &request.record);
    let mut conds = Vec::new();
    for (column, value) in &keys {
        conds.push(condition(&mut binder, column, CompareOp::Eq, value)?);
    }
    if !conds.is_empty() {
        text.push_str(&format!(" WHERE {}", conds.join(" AND ")));
    }
    text.push_str(" LIMIT 1");
    Ok(binder.finish(text))
}

fn list(style: SqlStyle, request: &Request) -> Option<Statement> {
    if request.records.is_empty() {
        return None;
    }
    let mut binder = Binder::new(style);
    let keys = &request.schema.keys;
    let mut text = format!(
        "SELECT {} FROM {} WHERE ",
        column_list(style, request),
        style.quote(&request.table)
    );
    if keys.len() == 1 {
        let placeholders: Vec<String> = request
            .records
            .iter()
            .filter_map(|r| r.get(&keys[0]).cloned())
            .map(|v| binder.bind(v))
            .collect();
        text.push_str(&format!(
            "{} IN ({})",
            style.quote(&keys[0]),
            placeholders.join(", ")
        ));
    } else {
        let groups: Vec<String> = request
            .records
            .iter()
            .map(|r| {
                let conds: Vec<String> = r
                    .iter()
                    .map(|(c, v)| format!("{} = {}", style.quote(c), binder.bind(v.clone())))
                    .collect();
                format!("({})", conds.join(" AND "))
            })
            .collect();
        text.push_str(&groups.join(" OR "));
    }
    Some(binder.finish(text))
}

fn insert(style: SqlStyle, request: &Request, replace: bool) -> Statement {
    let mut binder = Binder::new(style);
    let table = style.quote(&request.table);
    let columns: Vec<String> = request.record.keys().map(|c| style.quote(c)).collect();
    let placeholders: Vec<String> = request
        .record
        .values()
        .map(|v| binder.bind(v.clone()))
        .collect();

    let verb = match (replace, style) {
        (true, SqlStyle::Sqlite) => "INSERT OR REPLACE INTO",
        _ => "INSERT INTO",
    };
    let mut text = if columns.is_empty() {
        format!("{} {} DEFAULT VALUES", verb, table)
    } else {
        format!(
            "{} {} ({}) VALUES ({})",
            verb,
            table,
            columns.join(", "),
            placeholders.join(", ")
        )
    };

    if replace && style == SqlStyle::Postgres && !request.schema.keys.is_empty() {
        let keys: Vec<String> = request.schema.keys.iter().map(|k| style.quote(k)).collect();
        let sets: Vec<String> = request
            .record
            .keys()
            .filter(|c| !request.schema.is_key(c))
            .map(|c| format!("{} = EXCLUDED.{}", style.quote(c), style.quote(c)))
            .collect();
        if sets.is_empty() {
            text.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
        } else {
            text.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                sets.join(", ")
            ));
        }
    }
    binder.finish(text)
}

fn is_counter(request: &Request, column: &str) -> bool {
    request.op == Op::Incr
        && (request.options.counter.iter().any(|c| c == column)
            || request
                .schema
                .column(column)
                .map_or(false, |c| c.col_type() == ColumnType::Counter))
}

fn update(style: SqlStyle, request: &Request) -> DbResult<Option<Statement>> {
    let mut binder = Binder::new(style);
    let mut sets = Vec::new();
    for (column, value) in &request.record {
        if request.schema.is_key(column) {
            continue;
        }
        let col = style.quote(column);
        if is_counter(request, column) {
            sets.push(format!(
                "{} = COALESCE({}, 0) + {}",
                col,
                col,
                binder.bind(value.clone())
            ));
        } else {
            sets.push(format!("{} = {}", col, binder.bind(value.clone())));
        }
    }
    if sets.is_empty() {
        return Ok(None);
    }
    let mut text = format!(
        "UPDATE {} SET {}",
        style.quote(&request.table),
        sets.join(", ")
    );
    let keys = key_record(request, &request.record);
    let mut conds = Vec::new();
    for (column, value) in &keys {
        conds.push(condition(&mut binder, column, CompareOp::Eq, value)?);
    }
    if conds.is_empty() {
        return Err(DbError::Validation(format!(
            "update of {} without primary key",
            request.table
        )));
    }
    text.push_str(&format!(" WHERE {}", conds.join(" AND ")));
    Ok(Some(binder.finish(text)))
}

fn delete(style: SqlStyle, request: &Request) -> DbResult<Statement> {
    let mut binder = Binder::new(style);
    let mut text = format!("DELETE FROM {}", style.quote(&request.table));
    let keys = key_record(request, &request.record);
    if keys.is_empty() {
        return Err(DbError::Validation(format!(
            "delete from {} without conditions",
            request.table
        )));
    }
    text.push_str(&where_clause(&mut binder, request, &keys)?);
    Ok(binder.finish(text))
}

fn column_ddl(style: SqlStyle, name: &str, def: &ColumnDef) -> String {
    let mut ddl = format!("{} {}", style.quote(name), style.column_type(def));
    if def.not_null.unwrap_or(false) {
        ddl.push_str(" NOT NULL");
    }
    if let Some(dflt) = &def.dflt {
        ddl.push_str(&format!(" DEFAULT {}", dflt));
    }
    ddl
}

fn index_statements(style: SqlStyle, schema: &TableSchema) -> Vec<Statement> {
    schema
        .indexes
        .iter()
        .map(|index| {
            let cols: Vec<String> = index.columns.iter().map(|c| style.quote(c)).collect();
            Statement::new(
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    style.quote(&format!("{}_{}", schema.name, index.name)),
                    style.quote(&schema.name),
                    cols.join(", ")
                ),
                Vec::new(),
            )
        })
        .collect()
}

/// CREATE TABLE plus its secondary indexes
pub fn create_table(style: SqlStyle, schema: &TableSchema) -> Vec<Statement> {
    let mut defs: Vec<String> = schema
        .columns
        .iter()
        .map(|(name, def)| column_ddl(style, name, def))
        .collect();
    if !schema.keys.is_empty() {
        let keys: Vec<String> = schema.keys.iter().map(|k| style.quote(k)).collect();
        defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    let mut statements = vec![Statement::new(
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            style.quote(&schema.name),
            defs.join(", ")
        ),
        Vec::new(),
    )];
    statements.extend(index_statements(style, schema));
    statements
}

/// ALTER TABLE for columns the live table does not have yet
pub fn upgrade_table(style: SqlStyle, schema: &TableSchema, existing: &HashSet<String>) -> Vec<Statement> {
    let mut statements: Vec<Statement> = schema
        .columns
        .iter()
        .filter(|(name, _)| !existing.contains(*name))
        .map(|(name, def)| {
            Statement::new(
                format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    style.quote(&schema.name),
                    column_ddl(style, name, def)
                ),
                Vec::new(),
            )
        })
        .collect();
    statements.extend(index_statements(style, schema));
    statements
}

/// Trim the look-ahead row and compute the token for the next page
pub fn page_rows(request: &Request, native: &mut NativeResult) {
    if !matches!(request.op, Op::Select | Op::Search) {
        return;
    }
    if let Some(count) = request.options.count {
        if native.rows.len() > count {
            native.rows.truncate(count);
            native.more = true;
            native.next_token = Some(Value::from(start_offset(request) + count as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::request::QueryOptions;
    use crate::db::schema::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Arc<TableSchema> {
        let registry = SchemaRegistry::new();
        registry.describe_json(&json!({
            "items": {
                "id": {"type": "text", "primary": 1},
                "n": {"type": "counter"},
                "name": {"type": "text", "index": 1},
            }
        }));
        registry.get_table("items").unwrap()
    }

    fn request(op: Op, record: serde_json::Value, options: QueryOptions) -> Request {
        let record = record.as_object().cloned().unwrap_or_default();
        let mut req = Request::new(op, "items", record, options);
        req.schema = schema();
        req.ops = req.options.ops.clone();
        req
    }

    #[test]
    fn test_select_with_paging() {
        let req = request(
            Op::Select,
            json!({"name": "a"}),
            QueryOptions::new().with_count(2).with_start(Some(json!(4))),
        );
        let stmt = select(SqlStyle::Postgres, &req).unwrap();
        assert_eq!(
            stmt.text,
            "SELECT * FROM \"items\" WHERE \"name\" = $1 ORDER BY \"id\" LIMIT 3 OFFSET 4"
        );
        assert_eq!(stmt.values, vec![json!("a")]);
    }

    #[test]
    fn test_select_operators() {
        let req = request(
            Op::Select,
            json!({"id": ["a", "b"], "name": "pre"}),
            QueryOptions::new()
                .with_op("id", CompareOp::In)
                .with_op("name", CompareOp::BeginsWith),
        );
        let stmt = select(SqlStyle::Sqlite, &req).unwrap();
        assert_eq!(
            stmt.text,
            "SELECT * FROM \"items\" WHERE \"id\" IN (?, ?) AND SUBSTR(\"name\", 1, 3) = ? ORDER BY \"id\""
        );
        assert_eq!(stmt.values.len(), 3);
    }

    #[test]
    fn test_incr_uses_coalesce() {
        let req = request(Op::Incr, json!({"id": "a", "n": 2}), QueryOptions::new());
        let stmt = update(SqlStyle::Sqlite, &req).unwrap().unwrap();
        assert_eq!(
            stmt.text,
            "UPDATE \"items\" SET \"n\" = COALESCE(\"n\", 0) + ? WHERE \"id\" = ?"
        );
        assert_eq!(stmt.values, vec![json!(2), json!("a")]);
    }

    #[test]
    fn test_postgres_put_upserts() {
        let req = request(Op::Put, json!({"id": "a", "name": "x"}), QueryOptions::new());
        let stmt = insert(SqlStyle::Postgres, &req, true);
        assert_eq!(
            stmt.text,
            "INSERT INTO \"items\" (\"id\", \"name\") VALUES ($1, $2) ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        );
    }

    #[test]
    fn test_create_table_ddl() {
        let statements = create_table(SqlStyle::Sqlite, &schema());
        assert_eq!(
            statements[0].text,
            "CREATE TABLE IF NOT EXISTS \"items\" (\"id\" TEXT, \"n\" INTEGER, \"name\" TEXT, PRIMARY KEY (\"id\"))"
        );
        assert_eq!(
            statements[1].text,
            "CREATE INDEX IF NOT EXISTS \"items_index\" ON \"items\" (\"name\")"
        );
    }

    #[test]
    fn test_upgrade_adds_missing_columns() {
        let existing: HashSet<String> = ["id", "name"].iter().map(|s| s.to_string()).collect();
        let statements = upgrade_table(SqlStyle::Postgres, &schema(), &existing);
        assert_eq!(
            statements[0].text,
            "ALTER TABLE \"items\" ADD COLUMN \"n\" BIGINT"
        );
    }

    #[test]
    fn test_page_rows_sets_token() {
        let req = request(Op::Select, json!({}), QueryOptions::new().with_count(2));
        let mut native = NativeResult {
            rows: vec![Record::new(), Record::new(), Record::new()],
            ..Default::default()
        };
        page_rows(&req, &mut native);
        assert_eq!(native.rows.len(), 2);
        assert_eq!(native.next_token, Some(json!(2)));
    }

    #[test]
    fn test_between_requires_pair() {
        let req = request(
            Op::Select,
            json!({"name": ["a"]}),
            QueryOptions::new().with_op("name", CompareOp::Between),
        );
        assert!(matches!(
            select(SqlStyle::Sqlite, &req),
            Err(DbError::Validation(_))
        ));
    }
}
