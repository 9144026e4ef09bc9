// Schema Registry
// Merges table definitions contributed by independent modules into one column map per table

use crate::db::request::CompareOp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Declared column type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[serde(alias = "string", alias = "varchar")]
    Text,
    #[serde(alias = "integer")]
    Int,
    Bigint,
    Smallint,
    #[serde(alias = "float")]
    Real,
    #[serde(alias = "number", alias = "numeric")]
    Double,
    Counter,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "datetime")]
    Date,
    #[serde(alias = "timestamp")]
    Mtime,
    Uuid,
    Json,
    #[serde(alias = "object")]
    Obj,
    #[serde(alias = "list")]
    Array,
    Blob,
    #[serde(other)]
    Other,
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int
                | ColumnType::Bigint
                | ColumnType::Smallint
                | ColumnType::Counter
                | ColumnType::Mtime
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, ColumnType::Real | ColumnType::Double)
    }

    /// Values kept as structured JSON in the application
    pub fn is_json(&self) -> bool {
        matches!(self, ColumnType::Json | ColumnType::Obj | ColumnType::Array)
    }
}

/// Column descriptor; every property is optional so contributions merge field by field
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColumnDef {
    #[serde(rename = "type")]
    pub col_type: Option<ColumnType>,
    /// Position in the composite primary key
    pub primary: Option<u32>,
    pub index: Option<u32>,
    pub index1: Option<u32>,
    pub index2: Option<u32>,
    pub index3: Option<u32>,
    pub unique: Option<u32>,
    pub unique1: Option<u32>,
    #[serde(rename = "pub")]
    pub public: Option<bool>,
    /// Never returned to callers once results are cleaned up
    pub secure: Option<bool>,
    pub admin: Option<bool>,
    pub admins: Option<Vec<String>>,
    /// Only add may set it
    pub readonly: Option<bool>,
    /// Only update may set it
    pub writeonly: Option<bool>,
    pub hidden: Option<bool>,
    /// Default value filled on add/put
    pub value: Option<Value>,
    /// Stamp with the current time on add/put
    pub now: Option<bool>,
    /// Default expression used in DDL
    pub dflt: Option<String>,
    pub lower: Option<bool>,
    pub upper: Option<bool>,
    pub join: Option<Vec<String>>,
    pub unjoin: Option<Vec<String>>,
    pub strict_join: Option<bool>,
    pub separator: Option<String>,
    pub values: Option<Vec<Value>>,
    pub maxlength: Option<usize>,
    /// Default comparison operator in queries
    pub op: Option<CompareOp>,
    pub not_null: Option<bool>,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

/// Index field names and whether the group is unique
const INDEX_GROUPS: &[(&str, bool)] = &[
    ("index", false),
    ("index1", false),
    ("index2", false),
    ("index3", false),
    ("unique", true),
    ("unique1", true),
];

impl ColumnDef {
    pub fn new(col_type: ColumnType) -> Self {
        Self {
            col_type: Some(col_type),
            ..Default::default()
        }
    }

    pub fn with_primary(mut self, rank: u32) -> Self {
        self.primary = Some(rank);
        self
    }

    pub fn with_index(mut self, rank: u32) -> Self {
        self.index = Some(rank);
        self
    }

    pub fn with_join(mut self, columns: &[&str]) -> Self {
        self.join = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_unjoin(mut self, columns: &[&str]) -> Self {
        self.unjoin = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Override individual properties with those set in `other`
    pub fn merge(&mut self, other: &ColumnDef) {
        merge_fields!(
            self, other, col_type, primary, index, index1, index2, index3, unique, unique1,
            public, secure, admin, admins, readonly, writeonly, hidden, value, now, dflt, lower,
            upper, join, unjoin, strict_join, separator, values, maxlength, op, not_null,
        );
    }

    pub fn col_type(&self) -> ColumnType {
        self.col_type.unwrap_or(ColumnType::Text)
    }

    pub fn is_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn is_typed(&self) -> bool {
        self.col_type.is_some()
    }

    fn flag(v: Option<bool>) -> bool {
        v.unwrap_or(false)
    }

    pub fn is_hidden(&self) -> bool {
        Self::flag(self.hidden)
    }

    pub fn is_readonly(&self) -> bool {
        Self::flag(self.readonly)
    }

    pub fn is_writeonly(&self) -> bool {
        Self::flag(self.writeonly)
    }

    pub fn is_secure(&self) -> bool {
        Self::flag(self.secure)
    }

    pub fn is_public(&self) -> bool {
        Self::flag(self.public)
    }

    pub fn is_admin_only(&self) -> bool {
        Self::flag(self.admin) || self.admins.as_ref().map_or(false, |a| !a.is_empty())
    }

    fn index_rank(&self, group: &str) -> Option<u32> {
        match group {
            "index" => self.index,
            "index1" => self.index1,
            "index2" => self.index2,
            "index3" => self.index3,
            "unique" => self.unique,
            "unique1" => self.unique1,
            _ => None,
        }
    }
}

/// Named secondary index derived from column ranks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Authoritative definition of one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnDef>,
    pub keys: Vec<String>,
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    pub fn new(name: &str, columns: BTreeMap<String, ColumnDef>) -> Self {
        let keys = Self::ranked(&columns, |c| c.primary);
        let indexes = INDEX_GROUPS
            .iter()
            .filter_map(|(group, unique)| {
                let columns = Self::ranked(&columns, |c| c.index_rank(group));
                (!columns.is_empty()).then(|| IndexDef {
                    name: group.to_string(),
                    columns,
                    unique: *unique,
                })
            })
            .collect();
        Self {
            name: name.to_string(),
            columns,
            keys,
            indexes,
        }
    }

    fn ranked(columns: &BTreeMap<String, ColumnDef>, rank: impl Fn(&ColumnDef) -> Option<u32>) -> Vec<String> {
        let mut ranked: Vec<(u32, &String)> = columns
            .iter()
            .filter_map(|(name, col)| rank(col).map(|r| (r, name)))
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.keys.iter().any(|k| k == name)
    }
}

pub type TableDeltas = HashMap<String, BTreeMap<String, ColumnDef>>;

/// Process-wide table definitions
#[derive(Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge column deltas and recompute keys and indexes of every affected table
    pub fn describe(&self, deltas: TableDeltas) {
        let mut tables = self.tables.write();
        for (table, delta) in deltas {
            let mut columns = tables
                .get(&table)
                .map(|t| t.columns.clone())
                .unwrap_or_default();
            for (name, def) in delta {
                columns.entry(name).or_default().merge(&def);
            }
            tables.insert(table.clone(), Arc::new(TableSchema::new(&table, columns)));
        }
    }

    /// JSON form of `describe`; columns that are not objects are ignored
    pub fn describe_json(&self, value: &Value) {
        let Some(tables) = value.as_object() else {
            return;
        };
        let mut deltas = TableDeltas::new();
        for (table, columns) in tables {
            let Some(columns) = columns.as_object() else {
                continue;
            };
            let delta = deltas.entry(table.clone()).or_default();
            for (name, def) in columns {
                if !def.is_object() {
                    continue;
                }
                if let Ok(def) = serde_json::from_value::<ColumnDef>(def.clone()) {
                    delta.insert(name.clone(), def);
                }
            }
        }
        self.describe(deltas);
    }

    /// Remove a table definition entirely
    pub fn forget(&self, table: &str) {
        self.tables.write().remove(table);
    }

    pub fn get_table(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.read().get(table).cloned()
    }

    /// Definition of a table, empty for unknown tables
    pub fn table_or_empty(&self, table: &str) -> Arc<TableSchema> {
        self.get_table(table)
            .unwrap_or_else(|| Arc::new(TableSchema::new(table, BTreeMap::new())))
    }

    pub fn get_columns(&self, table: &str) -> BTreeMap<String, ColumnDef> {
        self.get_table(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub fn get_column(&self, table: &str, name: &str) -> Option<ColumnDef> {
        self.get_table(table).and_then(|t| t.columns.get(name).cloned())
    }

    pub fn get_keys(&self, table: &str) -> Vec<String> {
        self.get_table(table).map(|t| t.keys.clone()).unwrap_or_default()
    }

    pub fn get_indexes(&self, table: &str) -> Vec<IndexDef> {
        self.get_table(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default()
    }

    pub fn public_columns(&self, table: &str) -> Vec<String> {
        self.get_table(table)
            .map(|t| {
                t.columns
                    .iter()
                    .filter(|(_, c)| c.is_public())
                    .map(|(n, _)| n.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry.describe_json(&json!({
            "users": {
                "id": {"type": "text", "primary": 1},
                "login": {"type": "text", "unique": 1},
                "name": {"type": "text", "pub": true},
                "mtime": {"type": "bigint", "now": true, "index": 2},
                "status": {"index": 1},
            }
        }));
        registry
    }

    #[test]
    fn test_keys_follow_primary_rank() {
        let registry = SchemaRegistry::new();
        registry.describe_json(&json!({
            "t": {"b": {"primary": 2}, "a": {"primary": 3}, "c": {"primary": 1}, "d": {}}
        }));
        assert_eq!(registry.get_keys("t"), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_indexes_grouped_and_sorted() {
        let registry = registry();
        let indexes = registry.get_indexes("users");
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name, "index");
        assert_eq!(indexes[0].columns, vec!["status", "mtime"]);
        assert!(!indexes[0].unique);
        assert_eq!(indexes[1].columns, vec!["login"]);
        assert!(indexes[1].unique);
    }

    #[test]
    fn test_describe_is_idempotent() {
        let delta = json!({"users": {"email": {"type": "text", "lower": true}}});
        let once = registry();
        once.describe_json(&delta);
        let twice = registry();
        twice.describe_json(&delta);
        twice.describe_json(&delta);
        assert_eq!(
            *once.get_table("users").unwrap(),
            *twice.get_table("users").unwrap()
        );
    }

    #[test]
    fn test_merge_overrides_single_properties() {
        let registry = registry();
        registry.describe_json(&json!({"users": {"name": {"maxlength": 32}}}));
        let name = registry.get_column("users", "name").unwrap();
        assert_eq!(name.maxlength, Some(32));
        assert_eq!(name.col_type, Some(ColumnType::Text));
        assert!(name.is_public());
    }

    #[test]
    fn test_unknown_table_is_empty() {
        let registry = registry();
        assert!(registry.get_columns("nope").is_empty());
        assert!(registry.get_keys("nope").is_empty());
        assert!(registry.get_column("nope", "x").is_none());
    }

    #[test]
    fn test_malformed_columns_ignored() {
        let registry = registry();
        registry.describe_json(&json!({"users": {"bad": 5, "worse": "x", "ok": {"type": "int"}}}));
        let columns = registry.get_columns("users");
        assert!(!columns.contains_key("bad"));
        assert!(!columns.contains_key("worse"));
        assert_eq!(columns["ok"].col_type, Some(ColumnType::Int));
    }

    #[test]
    fn test_type_aliases() {
        let def: ColumnDef = serde_json::from_value(json!({"type": "boolean"})).unwrap();
        assert_eq!(def.col_type, Some(ColumnType::Bool));
        let def: ColumnDef = serde_json::from_value(json!({"type": "geopoint"})).unwrap();
        assert_eq!(def.col_type, Some(ColumnType::Other));
    }

    #[test]
    fn test_public_columns_and_forget() {
        let registry = registry();
        assert_eq!(registry.public_columns("users"), vec!["name"]);
        registry.forget("users");
        assert!(registry.tables().is_empty());
    }
}
