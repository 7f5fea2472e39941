//! Module D — the Schema Store. Versioned persistence of inferred schemas
//! with a pluggable backend, atomic multi-document update semantics, and a
//! process-wide sidecar cache for writes that failed to persist (spec
//! §4.D, §5 "Shared resource policy").

pub mod file;
pub mod mongo;

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{Column, DatabaseSchema, DocType, RelationalType, SchemaVersion, TableId, TableSchema};

pub use file::FileSchemaStore;
pub use mongo::MongoSchemaStore;

/// The wire/file representation of one `Column` (spec §6.2). Deliberately
/// narrower than the in-memory `Column`: `primaryKeyIndex`, `foreignKeyIndex`
/// and `isGenerated` are all recoverable from column order plus the stated
/// invariant ("an index column satisfies isPrimaryKey ∧ isGenerated ∧
/// isIndex"), and `virtualTableName` never survives finalization, so
/// nothing is actually lost across a store round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRow {
    pub field_path: String,
    pub sql_name: String,
    pub sql_type: RelationalType,
    pub db_type: DocType,
    pub is_index: bool,
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key_table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key_column_name: Option<String>,
}

impl From<&Column> for ColumnRow {
    fn from(c: &Column) -> Self {
        ColumnRow {
            field_path: c.field_path.clone(),
            sql_name: c.sql_name.clone(),
            sql_type: c.sql_type,
            db_type: c.db_type,
            is_index: c.is_index,
            is_primary_key: c.is_primary_key,
            foreign_key_table_name: c.foreign_key_table_name.clone(),
            foreign_key_column_name: c.foreign_key_column_name.clone(),
        }
    }
}

/// Parses the trailing `_index_lvl_<N>` suffix inference always produces
/// for generated index columns, to recover `arrayIndexLevel` on load.
fn parse_index_level(sql_name: &str) -> Option<u32> {
    sql_name.rsplit_once("_index_lvl_").and_then(|(_, n)| n.parse().ok())
}

/// Rebuilds the richer in-memory `Column` list from persisted rows,
/// recomputing `primaryKeyIndex`/`foreignKeyIndex` from row order. Rejects
/// duplicate `sqlName`s rather than silently keeping whichever one a naive
/// index rebuild would see last (spec §9 "duplicate keys are rejected at
/// import time").
fn columns_from_rows(rows: &[ColumnRow]) -> EngineResult<Vec<Column>> {
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::with_capacity(rows.len());
    for r in rows {
        if let Some(first) = seen.insert(r.sql_name.as_str(), r.field_path.as_str()) {
            return Err(EngineError::duplicate_column(first, r.field_path.clone()));
        }
    }
    let mut pk_ordinal = 0u32;
    let mut fk_ordinal = 0u32;
    Ok(rows
        .iter()
        .map(|r| {
            let primary_key_index = if r.is_primary_key {
                pk_ordinal += 1;
                pk_ordinal
            } else {
                0
            };
            let foreign_key_index = if r.foreign_key_table_name.is_some() {
                fk_ordinal += 1;
                Some(fk_ordinal)
            } else {
                None
            };
            Column {
                field_path: r.field_path.clone(),
                sql_name: r.sql_name.clone(),
                sql_type: r.sql_type,
                db_type: r.db_type,
                is_index: r.is_index,
                is_primary_key: r.is_primary_key,
                primary_key_index,
                foreign_key_table_name: r.foreign_key_table_name.clone(),
                foreign_key_column_name: r.foreign_key_column_name.clone(),
                foreign_key_index,
                array_index_level: parse_index_level(&r.sql_name),
                is_generated: r.is_primary_key && r.is_index,
                virtual_table_name: None,
            }
        })
        .collect())
}

/// The wire/file representation of one `TableSchema` (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchemaRow {
    #[serde(rename = "_id")]
    pub id: TableId,
    pub sql_name: String,
    pub collection_name: String,
    pub modify_date: DateTime<Utc>,
    pub columns: Vec<ColumnRow>,
    pub uuid: uuid::Uuid,
}

impl From<&TableSchema> for TableSchemaRow {
    fn from(t: &TableSchema) -> Self {
        TableSchemaRow {
            id: t.id,
            sql_name: t.sql_name.clone(),
            collection_name: t.collection_name.clone(),
            modify_date: t.modify_date,
            columns: t.columns.iter().map(ColumnRow::from).collect(),
            uuid: t.uuid,
        }
    }
}

impl TryFrom<TableSchemaRow> for TableSchema {
    type Error = EngineError;

    fn try_from(row: TableSchemaRow) -> EngineResult<Self> {
        let mut t = TableSchema::new(row.id, row.sql_name, row.collection_name);
        t.uuid = row.uuid;
        t.modify_date = row.modify_date;
        t.columns = columns_from_rows(&row.columns)?;
        t.rebuild_index();
        Ok(t)
    }
}

/// The `SchemaStore` backend contract (spec §4.D "Operations"). Mirrors the
/// shape of the teacher's `engine/traits.rs::DataEngine`: `Send + Sync`,
/// async methods, `EngineResult<T>` returns.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn read(&self, name: &str) -> EngineResult<Option<DatabaseSchema>>;
    async fn read_version(&self, name: &str, version: SchemaVersion) -> EngineResult<Option<DatabaseSchema>>;
    async fn list(&self) -> EngineResult<Vec<DatabaseSchema>>;
    async fn read_table(&self, name: &str, version: SchemaVersion, table_id: TableId) -> EngineResult<Option<TableSchema>>;
    async fn read_tables(&self, name: &str, version: SchemaVersion, ids: &[TableId]) -> EngineResult<Vec<TableSchema>>;
    /// Insert-only; fails if `(schema.schemaName, schema.schemaVersion)` already exists.
    async fn write(&self, schema: DatabaseSchema, tables: Vec<TableSchema>) -> EngineResult<()>;
    /// Diffs `tables` against the latest version's references and inserts a
    /// new schema row at `latest.version + 1`.
    async fn update(&self, name: &str, sql_name: &str, tables: Vec<TableSchema>) -> EngineResult<DatabaseSchema>;
    async fn remove(&self, name: &str) -> EngineResult<()>;
    async fn remove_version(&self, name: &str, version: SchemaVersion) -> EngineResult<()>;
}

/// Process-wide sidecar map (spec §5 "Shared resource policy"): populated
/// only when a store write fails to persist, consulted before the backend
/// on every subsequent read within the process so a session observes its
/// own writes even against a backend without multi-document transactions.
/// Never evicted except on process exit.
static SIDECAR: OnceLock<RwLock<HashMap<TableId, TableSchema>>> = OnceLock::new();

fn sidecar() -> &'static RwLock<HashMap<TableId, TableSchema>> {
    SIDECAR.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn sidecar_put(table: TableSchema) {
    sidecar().write().insert(table.id, table);
}

pub fn sidecar_get(id: TableId) -> Option<TableSchema> {
    sidecar().read().get(&id).cloned()
}

pub fn sidecar_len() -> usize {
    sidecar().read().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableId;

    #[test]
    fn column_row_round_trips_pk_and_index_ordinals() {
        let mut table = TableSchema::new(TableId::new(), "products_tags", "products");
        table.upsert_column(Column {
            field_path: "_id".into(),
            sql_name: "products__id".into(),
            sql_type: RelationalType::Varchar,
            db_type: DocType::String,
            is_index: false,
            is_primary_key: true,
            primary_key_index: 1,
            foreign_key_table_name: Some("products".into()),
            foreign_key_column_name: Some("products__id".into()),
            foreign_key_index: Some(1),
            array_index_level: None,
            is_generated: false,
            virtual_table_name: None,
        });
        table.upsert_column(Column {
            field_path: "tags".into(),
            sql_name: "tags_index_lvl_0".into(),
            sql_type: RelationalType::Bigint,
            db_type: DocType::Int64,
            is_index: true,
            is_primary_key: true,
            primary_key_index: 2,
            foreign_key_table_name: None,
            foreign_key_column_name: None,
            foreign_key_index: None,
            array_index_level: Some(0),
            is_generated: true,
            virtual_table_name: None,
        });

        let row = TableSchemaRow::from(&table);
        let rebuilt = TableSchema::try_from(row).unwrap();

        assert_eq!(rebuilt.column("products__id").unwrap().primary_key_index, 1);
        let idx = rebuilt.column("tags_index_lvl_0").unwrap();
        assert_eq!(idx.primary_key_index, 2);
        assert!(idx.is_generated);
        assert_eq!(idx.array_index_level, Some(0));
    }

    #[test]
    fn duplicate_sql_name_is_rejected_on_load() {
        let rows = vec![
            ColumnRow {
                field_path: "_id".into(),
                sql_name: "products__id".into(),
                sql_type: RelationalType::Varchar,
                db_type: DocType::String,
                is_index: false,
                is_primary_key: true,
                foreign_key_table_name: None,
                foreign_key_column_name: None,
            },
            ColumnRow {
                field_path: "id".into(),
                sql_name: "products__id".into(),
                sql_type: RelationalType::Varchar,
                db_type: DocType::String,
                is_index: false,
                is_primary_key: false,
                foreign_key_table_name: None,
                foreign_key_column_name: None,
            },
        ];
        let row = TableSchemaRow {
            id: TableId::new(),
            sql_name: "products".into(),
            collection_name: "products".into(),
            modify_date: Utc::now(),
            columns: rows,
            uuid: uuid::Uuid::new_v4(),
        };
        let err = TableSchema::try_from(row).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::SchemaWriteFailed { first_column: Some(_), second_column: Some(_), .. }));
    }

    #[test]
    fn sidecar_survives_across_reads() {
        let table = TableSchema::new(TableId::new(), "t", "c");
        let id = table.id;
        sidecar_put(table);
        assert!(sidecar_get(id).is_some());
        assert!(sidecar_len() >= 1);
    }
}
