//! Core data model: relational types, document types, columns, tables and
//! database schemas shared by every subsystem in this crate.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed relational type enumeration (spec §3.1). `Array` and
/// `JavaObject` are interim-only: the inference engine's finalization pass
/// (`inference::finalize`) guarantees neither ever survives on a column of
/// a returned `TableSchema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationalType {
    Null,
    Boolean,
    Integer,
    Bigint,
    Double,
    Decimal,
    Timestamp,
    Varbinary,
    Varchar,
    Array,
    JavaObject,
}

impl RelationalType {
    pub fn is_interim(self) -> bool {
        matches!(self, RelationalType::Array | RelationalType::JavaObject)
    }
}

impl fmt::Display for RelationalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationalType::Null => "null",
            RelationalType::Boolean => "boolean",
            RelationalType::Integer => "integer",
            RelationalType::Bigint => "bigint",
            RelationalType::Double => "double",
            RelationalType::Decimal => "decimal",
            RelationalType::Timestamp => "timestamp",
            RelationalType::Varbinary => "varbinary",
            RelationalType::Varchar => "varchar",
            RelationalType::Array => "array",
            RelationalType::JavaObject => "java_object",
        };
        f.write_str(s)
    }
}

/// The closed document type enumeration (spec §3.2), mapped from BSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Boolean,
    Binary,
    DateTime,
    Decimal128,
    Double,
    Int32,
    Int64,
    MaxKey,
    MinKey,
    Null,
    ObjectId,
    String,
    Array,
    Document,
}

impl DocType {
    pub fn is_complex(self) -> bool {
        matches!(self, DocType::Array | DocType::Document)
    }

    /// Classify a live BSON value into its document type.
    pub fn of_bson(value: &mongodb::bson::Bson) -> DocType {
        use mongodb::bson::Bson;
        match value {
            Bson::Boolean(_) => DocType::Boolean,
            Bson::Binary(_) => DocType::Binary,
            Bson::DateTime(_) => DocType::DateTime,
            Bson::Decimal128(_) => DocType::Decimal128,
            Bson::Double(_) => DocType::Double,
            Bson::Int32(_) => DocType::Int32,
            Bson::Int64(_) => DocType::Int64,
            Bson::MaxKey => DocType::MaxKey,
            Bson::MinKey => DocType::MinKey,
            Bson::Null | Bson::Undefined => DocType::Null,
            Bson::ObjectId(_) => DocType::ObjectId,
            Bson::String(_) | Bson::Symbol(_) | Bson::RegularExpression(_) | Bson::JavaScriptCode(_) => {
                DocType::String
            }
            Bson::Array(_) => DocType::Array,
            Bson::Document(_) => DocType::Document,
            // Timestamp, DbPointer and anything else we don't special-case
            // serialize to a scalar string representation.
            _ => DocType::String,
        }
    }
}

/// A stable, opaque table identifier (spec §3.3, "id"). Newtype over `Uuid`,
/// matching the teacher's `SessionId`/`QueryId` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub Uuid);

impl TableId {
    pub fn new() -> Self {
        TableId(Uuid::new_v4())
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing schema version, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    pub const INITIAL: SchemaVersion = SchemaVersion(1);

    pub fn next(self) -> SchemaVersion {
        SchemaVersion(self.0 + 1)
    }
}

/// A single relational column (spec §3.3 "Column").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub field_path: String,
    pub sql_name: String,
    pub sql_type: RelationalType,
    pub db_type: DocType,
    pub is_index: bool,
    pub is_primary_key: bool,
    /// 1-based PK ordinal, 0 if this column is not part of the PK.
    pub primary_key_index: u32,
    pub foreign_key_table_name: Option<String>,
    pub foreign_key_column_name: Option<String>,
    pub foreign_key_index: Option<u32>,
    /// 0-based array nesting depth; `None` for non-index columns.
    pub array_index_level: Option<u32>,
    pub is_generated: bool,
    /// Non-null while this column is still a placeholder for a complex
    /// field the inference engine has not yet (or no longer) materialized
    /// as a virtual table.
    pub virtual_table_name: Option<String>,
}

impl Column {
    pub fn is_pushable_index_column(&self) -> bool {
        self.is_primary_key && self.is_generated && self.is_index
    }
}

/// A relational table (spec §3.3 "Table schema"). `columns` is
/// insertion-ordered; `by_name` is a derived lookup index, never the
/// source of truth for iteration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub sql_name: String,
    pub collection_name: String,
    pub uuid: Uuid,
    pub modify_date: DateTime<Utc>,
    pub columns: Vec<Column>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
}

impl TableSchema {
    pub fn new(id: TableId, sql_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        TableSchema {
            id,
            sql_name: sql_name.into(),
            collection_name: collection_name.into(),
            uuid: Uuid::new_v4(),
            modify_date: Utc::now(),
            columns: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn column(&self, sql_name: &str) -> Option<&Column> {
        self.by_name.get(sql_name).map(|&i| &self.columns[i])
    }

    pub fn column_mut(&mut self, sql_name: &str) -> Option<&mut Column> {
        if let Some(&i) = self.by_name.get(sql_name) {
            Some(&mut self.columns[i])
        } else {
            None
        }
    }

    /// Insert a new column, or overwrite in place if `sql_name` already
    /// exists (preserving its position — field order within one document
    /// visit never reshuffles previously emitted columns).
    pub fn upsert_column(&mut self, column: Column) {
        if let Some(&i) = self.by_name.get(&column.sql_name) {
            self.columns[i] = column;
        } else {
            self.by_name.insert(column.sql_name.clone(), self.columns.len());
            self.columns.push(column);
        }
    }

    pub fn remove_column(&mut self, sql_name: &str) -> Option<Column> {
        let idx = self.by_name.remove(sql_name)?;
        let removed = self.columns.remove(idx);
        // Reindex everything after the removed slot.
        for (name, i) in self.by_name.iter_mut() {
            if *i > idx {
                *i -= 1;
            }
            let _ = name;
        }
        Some(removed)
    }

    pub fn primary_key_columns(&self) -> Vec<&Column> {
        let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.is_primary_key).collect();
        pk.sort_by_key(|c| c.primary_key_index);
        pk
    }

    pub fn primary_key_columns_cloned(&self) -> Vec<Column> {
        self.primary_key_columns().into_iter().cloned().collect()
    }

    pub fn rebuild_index(&mut self) {
        self.by_name.clear();
        for (i, c) in self.columns.iter().enumerate() {
            self.by_name.insert(c.sql_name.clone(), i);
        }
    }
}

/// A foreign-key edge, child-table to parent-table (spec §3.3
/// "Relationships").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKeyRef {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// The database-level schema envelope (spec §3.3 "Database schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub schema_name: String,
    pub schema_version: SchemaVersion,
    pub sql_name: String,
    pub modify_date: DateTime<Utc>,
    pub table_references: Vec<TableId>,
}

/// A `TableLoader` supplies lazily materialized tables to a
/// `DatabaseSchemaMetadata` without that type reaching into the Schema
/// Store directly (spec §4.C / §9 design note: "two injected callables").
pub trait TableLoader: Send + Sync {
    fn get(&self, id: TableId) -> Option<TableSchema>;
    fn get_all(&self, ids: &[TableId]) -> Vec<TableSchema>;
}

/// In-memory representation of one database schema version plus a lazily
/// materialized table map (spec §4.C Schema Model).
pub struct DatabaseSchemaMetadata {
    pub schema: DatabaseSchema,
    loader: Box<dyn TableLoader>,
    cache: HashMap<TableId, TableSchema>,
}

impl DatabaseSchemaMetadata {
    pub fn new(schema: DatabaseSchema, loader: Box<dyn TableLoader>) -> Self {
        DatabaseSchemaMetadata {
            schema,
            loader,
            cache: HashMap::new(),
        }
    }

    /// Load and cache a single table, avoiding the cost of materializing
    /// the whole catalog when the planner needs only one table.
    pub fn get(&mut self, id: TableId) -> Option<&TableSchema> {
        if !self.cache.contains_key(&id) {
            let table = self.loader.get(id)?;
            self.cache.insert(id, table);
        }
        self.cache.get(&id)
    }

    pub fn get_all(&mut self, ids: &[TableId]) -> Vec<&TableSchema> {
        let missing: Vec<TableId> = ids.iter().copied().filter(|id| !self.cache.contains_key(id)).collect();
        if !missing.is_empty() {
            for table in self.loader.get_all(&missing) {
                self.cache.insert(table.id, table);
            }
        }
        ids.iter().filter_map(|id| self.cache.get(id)).collect()
    }

    pub fn all_table_ids(&self) -> &[TableId] {
        &self.schema.table_references
    }
}
