//! File-backed `SchemaStore` (spec §4.D "File-backed variant", §6.3).
//! One JSON document per `(databaseName, schemaName)` in a user-scoped
//! directory, cached in memory. Grounded directly on the teacher's
//! `virtual_relations/store.rs::VirtualRelationStore`
//! (`RwLock<HashMap<...>>` cache, `ensure_loaded`/`save` pair), generalized
//! from one relation list per connection to one `{schema, tableSchemas}`
//! document per schema name.
//!
//! Only the latest version of each schema is retained on disk — this
//! backend targets the single-operator CLI workflow (spec §6.4), not
//! multi-version history, which the remote `MongoSchemaStore` backend
//! already provides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{DatabaseSchema, SchemaVersion, TableId, TableSchema};

use super::{sidecar_put, SchemaStore, TableSchemaRow};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileDocument {
    schema: DatabaseSchema,
    table_schemas: Vec<TableSchemaRow>,
}

pub struct FileSchemaStore {
    database_name: String,
    data_dir: PathBuf,
    cache: RwLock<HashMap<String, Option<FileDocument>>>,
}

/// File names escape any of `/ ? % * : | " < > \` to `_` (spec §4.D).
/// Not reversible: distinct logical names that collide after substitution
/// collide on disk too (spec §9 "Schema-file charset pitfalls").
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if "/?%*:|\"<>\\".contains(c) { '_' } else { c })
        .collect()
}

impl FileSchemaStore {
    pub fn new(data_dir: PathBuf, database_name: impl Into<String>) -> Self {
        let _ = std::fs::create_dir_all(&data_dir);
        FileSchemaStore {
            database_name: database_name.into(),
            data_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn file_path(&self, schema_name: &str) -> PathBuf {
        let key = sanitize(&format!("{}__{}", self.database_name, schema_name));
        self.data_dir.join(format!("{key}.json"))
    }

    fn ensure_loaded(&self, schema_name: &str) -> Option<FileDocument> {
        if let Some(cached) = self.cache.read().get(schema_name) {
            return cached.clone();
        }
        let doc = Self::read_file(&self.file_path(schema_name));
        self.cache.write().insert(schema_name.to_string(), doc.clone());
        doc
    }

    fn read_file(path: &Path) -> Option<FileDocument> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn save(&self, schema_name: &str, doc: &FileDocument) -> EngineResult<()> {
        let path = self.file_path(schema_name);
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| EngineError::internal(format!("failed to serialize schema {schema_name}: {e}")))?;
        std::fs::write(&path, data).map_err(|e| {
            EngineError::transient(format!("failed to write schema file {}: {e}", path.display()))
        })?;
        self.cache.write().insert(schema_name.to_string(), Some(doc.clone()));
        Ok(())
    }
}

#[async_trait]
impl SchemaStore for FileSchemaStore {
    async fn read(&self, name: &str) -> EngineResult<Option<DatabaseSchema>> {
        Ok(self.ensure_loaded(name).map(|d| d.schema))
    }

    async fn read_version(&self, name: &str, version: SchemaVersion) -> EngineResult<Option<DatabaseSchema>> {
        Ok(self
            .ensure_loaded(name)
            .filter(|d| d.schema.schema_version == version)
            .map(|d| d.schema))
    }

    async fn list(&self) -> EngineResult<Vec<DatabaseSchema>> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.data_dir) {
            for entry in entries.flatten() {
                if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(doc) = Self::read_file(&entry.path()) {
                    out.push(doc.schema);
                }
            }
        }
        out.sort_by(|a, b| (a.schema_name.as_str(), a.schema_version).cmp(&(b.schema_name.as_str(), b.schema_version)));
        Ok(out)
    }

    async fn read_table(&self, name: &str, version: SchemaVersion, table_id: TableId) -> EngineResult<Option<TableSchema>> {
        if let Some(table) = super::sidecar_get(table_id) {
            return Ok(Some(table));
        }
        let Some(doc) = self.ensure_loaded(name) else { return Ok(None) };
        if doc.schema.schema_version != version {
            return Ok(None);
        }
        doc.table_schemas.into_iter().find(|r| r.id == table_id).map(TableSchema::try_from).transpose()
    }

    async fn read_tables(&self, name: &str, version: SchemaVersion, ids: &[TableId]) -> EngineResult<Vec<TableSchema>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(t) = self.read_table(name, version, id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    async fn write(&self, schema: DatabaseSchema, tables: Vec<TableSchema>) -> EngineResult<()> {
        if self.ensure_loaded(&schema.schema_name).is_some() {
            return Err(EngineError::schema_write_failed(format!(
                "schema {} already exists",
                schema.schema_name
            )));
        }
        let doc = FileDocument {
            schema,
            table_schemas: tables.iter().map(TableSchemaRow::from).collect(),
        };
        if let Err(e) = self.save(&doc.schema.schema_name.clone(), &doc) {
            for table in tables {
                sidecar_put(table);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn update(&self, name: &str, sql_name: &str, tables: Vec<TableSchema>) -> EngineResult<DatabaseSchema> {
        let previous = self.ensure_loaded(name);
        let next_version = previous
            .as_ref()
            .map(|d| d.schema.schema_version.next())
            .unwrap_or(SchemaVersion::INITIAL);

        let schema = DatabaseSchema {
            schema_name: name.to_string(),
            schema_version: next_version,
            sql_name: sql_name.to_string(),
            modify_date: chrono::Utc::now(),
            table_references: tables.iter().map(|t| t.id).collect(),
        };
        let doc = FileDocument {
            schema: schema.clone(),
            table_schemas: tables.iter().map(TableSchemaRow::from).collect(),
        };
        // Atomic update: the previous file content (either a fully
        // consistent pre-update set, or nothing) is left untouched unless
        // `save` fully succeeds, so readers never observe a mixed set
        // (testable property 6).
        if let Err(e) = self.save(name, &doc) {
            for table in tables {
                sidecar_put(table);
            }
            return Err(e);
        }
        Ok(schema)
    }

    async fn remove(&self, name: &str) -> EngineResult<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| EngineError::transient(format!("failed to remove schema file {}: {e}", path.display())))?;
        }
        self.cache.write().insert(name.to_string(), None);
        Ok(())
    }

    async fn remove_version(&self, name: &str, version: SchemaVersion) -> EngineResult<()> {
        if let Some(doc) = self.ensure_loaded(name) {
            if doc.schema.schema_version == version {
                return self.remove(name).await;
            }
        }
        Ok(())
    }
}
