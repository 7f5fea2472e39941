//! Remote, document-store-backed `SchemaStore` (spec §4.D, §6.2). Backs
//! onto two collections, `_sqlSchemas` and `_sqlTableSchemas`, using the
//! `mongodb` crate the way `engine/drivers/mongodb.rs` already does:
//! client sessions for multi-document transactions when the server
//! supports them, `run_command` for the capability probe, and the same
//! authentication-failure classification shape as
//! `MongoDriver::create_client_and_ping`'s `classify_auth_error` flag.

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection};

use crate::error::{EngineError, EngineResult};
use crate::types::{DatabaseSchema, SchemaVersion, TableId, TableSchema};

use super::{sidecar_put, SchemaStore, TableSchemaRow};

const SCHEMAS_COLLECTION: &str = "_sqlSchemas";
const TABLE_SCHEMAS_COLLECTION: &str = "_sqlTableSchemas";

pub struct MongoSchemaStore {
    client: Client,
    database_name: String,
}

impl MongoSchemaStore {
    pub fn new(client: Client, database_name: impl Into<String>) -> Self {
        MongoSchemaStore { client, database_name: database_name.into() }
    }

    fn schemas(&self) -> Collection<DatabaseSchema> {
        self.client.database(&self.database_name).collection(SCHEMAS_COLLECTION)
    }

    fn table_schemas(&self) -> Collection<TableSchemaRow> {
        self.client.database(&self.database_name).collection(TABLE_SCHEMAS_COLLECTION)
    }

    /// Capability probe (spec §4.D "Atomicity"): server version >= 4 AND a
    /// replica-set identity is present. Lifted almost verbatim from
    /// `MongoDriver::detect_transaction_support` /
    /// `hello_supports_transactions`.
    pub async fn supports_transactions(&self) -> bool {
        let hello = match self.client.database("admin").run_command(doc! { "hello": 1 }).await {
            Ok(doc) => doc,
            Err(_) => return false,
        };
        hello_supports_transactions(&hello)
    }

    async fn latest(&self, name: &str) -> EngineResult<Option<DatabaseSchema>> {
        let filter = doc! { "schemaName": name };
        let find_options = mongodb::options::FindOptions::builder()
            .sort(doc! { "schemaVersion": -1 })
            .limit(1)
            .build();
        let mut cursor = self
            .schemas()
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(classify)?;
        Ok(cursor.try_next().await.map_err(classify)?)
    }

    /// Swallows the "already exists" error so concurrent first-time
    /// creators never race each other (spec §4.D "Collections").
    async fn ensure_collections(&self) {
        let db = self.client.database(&self.database_name);
        let _ = db.create_collection(SCHEMAS_COLLECTION).await;
        let _ = db.create_collection(TABLE_SCHEMAS_COLLECTION).await;
    }
}

/// `hello`/`isMaster` reports a replica-set identity either via `setName`
/// (a real replica set) or `msg == "isdbgrid"` (a mongos router), and a
/// present `logicalSessionTimeoutMinutes` implies server support for
/// client sessions — together these imply multi-document transaction
/// support.
fn hello_supports_transactions(hello: &Document) -> bool {
    let has_replica_identity = hello.get_str("setName").is_ok() || hello.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false);
    let has_session_timeout = hello.contains_key("logicalSessionTimeoutMinutes");
    has_replica_identity && has_session_timeout
}

fn classify(err: mongodb::error::Error) -> EngineError {
    let code = match &*err.kind {
        mongodb::error::ErrorKind::Command(command_error) => Some(command_error.code),
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_error)) => {
            Some(write_error.code)
        }
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteConcernError(wc_error)) => {
            Some(wc_error.code)
        }
        _ => None,
    };
    EngineError::classify_store_error(&err.to_string(), code)
}

#[async_trait]
impl SchemaStore for MongoSchemaStore {
    #[tracing::instrument(skip(self), fields(database = %self.database_name))]
    async fn read(&self, name: &str) -> EngineResult<Option<DatabaseSchema>> {
        self.latest(name).await
    }

    #[tracing::instrument(skip(self), fields(database = %self.database_name))]
    async fn read_version(&self, name: &str, version: SchemaVersion) -> EngineResult<Option<DatabaseSchema>> {
        let filter = doc! { "schemaName": name, "schemaVersion": version.0 as i64 };
        let mut cursor = self.schemas().find(filter).await.map_err(classify)?;
        Ok(cursor.try_next().await.map_err(classify)?)
    }

    async fn list(&self) -> EngineResult<Vec<DatabaseSchema>> {
        let find_options = mongodb::options::FindOptions::builder()
            .sort(doc! { "schemaName": 1, "schemaVersion": 1 })
            .build();
        let cursor = self.schemas().find(doc! {}).with_options(find_options).await.map_err(classify)?;
        cursor.try_collect::<Vec<_>>().await.map_err(classify)
    }

    #[tracing::instrument(skip(self))]
    async fn read_table(&self, name: &str, version: SchemaVersion, table_id: TableId) -> EngineResult<Option<TableSchema>> {
        if let Some(table) = super::sidecar_get(table_id) {
            return Ok(Some(table));
        }
        let _ = (name, version);
        let filter = doc! { "_id": table_id.0 };
        let mut cursor = self.table_schemas().find(filter).await.map_err(classify)?;
        cursor.try_next().await.map_err(classify)?.map(TableSchema::try_from).transpose()
    }

    async fn read_tables(&self, name: &str, version: SchemaVersion, ids: &[TableId]) -> EngineResult<Vec<TableSchema>> {
        let mut out = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for &id in ids {
            if let Some(table) = super::sidecar_get(id) {
                out.push(table);
            } else {
                missing.push(id.0);
            }
        }
        if !missing.is_empty() {
            let filter = doc! { "_id": { "$in": missing } };
            let cursor = self.table_schemas().find(filter).await.map_err(classify)?;
            let rows: Vec<TableSchemaRow> = cursor.try_collect().await.map_err(classify)?;
            for row in rows {
                out.push(TableSchema::try_from(row)?);
            }
        }
        let _ = (name, version);
        Ok(out)
    }

    #[tracing::instrument(skip(self, tables))]
    async fn write(&self, schema: DatabaseSchema, tables: Vec<TableSchema>) -> EngineResult<()> {
        self.ensure_collections().await;

        let rows: Vec<TableSchemaRow> = tables.iter().map(TableSchemaRow::from).collect();
        let use_transaction = self.supports_transactions().await;

        let result = if use_transaction {
            self.write_transactional(&schema, &rows).await
        } else {
            self.write_best_effort(&schema, &rows).await
        };

        if let Err(e) = result {
            for table in tables {
                sidecar_put(table);
            }
            return Err(e);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, tables))]
    async fn update(&self, name: &str, sql_name: &str, tables: Vec<TableSchema>) -> EngineResult<DatabaseSchema> {
        let previous = self.latest(name).await?;
        let next_version = previous.as_ref().map(|s| s.schema_version.next()).unwrap_or(SchemaVersion::INITIAL);

        let new_ids: std::collections::HashSet<TableId> = tables.iter().map(|t| t.id).collect();
        let superseded: Vec<mongodb::bson::Uuid> = previous
            .as_ref()
            .map(|s| s.table_references.iter().filter(|id| !new_ids.contains(id)).map(|id| id.0.into()).collect())
            .unwrap_or_default();

        let schema = DatabaseSchema {
            schema_name: name.to_string(),
            schema_version: next_version,
            sql_name: sql_name.to_string(),
            modify_date: chrono::Utc::now(),
            table_references: tables.iter().map(|t| t.id).collect(),
        };
        let rows: Vec<TableSchemaRow> = tables.iter().map(TableSchemaRow::from).collect();

        if !superseded.is_empty() {
            let _ = self.table_schemas().delete_many(doc! { "_id": { "$in": superseded } }).await;
        }
        if let Err(e) = self.write_best_effort(&schema, &rows).await {
            for table in tables {
                sidecar_put(table);
            }
            return Err(e);
        }
        Ok(schema)
    }

    async fn remove(&self, name: &str) -> EngineResult<()> {
        let ids: Vec<mongodb::bson::Uuid> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.schema_name == name)
            .flat_map(|s| s.table_references.into_iter().map(|id| id.0.into()))
            .collect();
        self.schemas().delete_many(doc! { "schemaName": name }).await.map_err(classify)?;
        if !ids.is_empty() {
            self.table_schemas().delete_many(doc! { "_id": { "$in": ids } }).await.map_err(classify)?;
        }
        Ok(())
    }

    async fn remove_version(&self, name: &str, version: SchemaVersion) -> EngineResult<()> {
        let Some(schema) = self.read_version(name, version).await? else {
            // No-op if the target is absent (spec §4.D "idempotent on retry").
            return Ok(());
        };
        self.schemas()
            .delete_one(doc! { "schemaName": name, "schemaVersion": version.0 as i64 })
            .await
            .map_err(classify)?;
        let ids: Vec<mongodb::bson::Uuid> = schema.table_references.into_iter().map(|id| id.0.into()).collect();
        if !ids.is_empty() {
            self.table_schemas().delete_many(doc! { "_id": { "$in": ids } }).await.map_err(classify)?;
        }
        Ok(())
    }
}

impl MongoSchemaStore {
    /// Every row and the schema document itself are upserted keyed on their
    /// natural identity, so a retry of an identical write (the client never
    /// having seen the first attempt's confirmation) succeeds instead of
    /// failing on re-insert (spec §4.D "Atomicity").
    async fn write_transactional(&self, schema: &DatabaseSchema, rows: &[TableSchemaRow]) -> EngineResult<()> {
        let mut session = self.client.start_session().await.map_err(classify)?;
        session.start_transaction().await.map_err(classify)?;
        let upsert = mongodb::options::ReplaceOptions::builder().upsert(true).build();
        for row in rows {
            let filter = doc! { "_id": row.id.0 };
            if let Err(e) = self
                .table_schemas()
                .replace_one(filter, row)
                .with_options(upsert.clone())
                .session(&mut session)
                .await
            {
                let _ = session.abort_transaction().await;
                return Err(classify(e));
            }
        }
        let filter = doc! { "schemaName": &schema.schema_name, "schemaVersion": schema.schema_version.0 as i64 };
        if let Err(e) = self
            .schemas()
            .replace_one(filter, schema)
            .with_options(upsert)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(classify(e));
        }
        session.commit_transaction().await.map_err(classify)
    }

    async fn write_best_effort(&self, schema: &DatabaseSchema, rows: &[TableSchemaRow]) -> EngineResult<()> {
        let upsert = mongodb::options::ReplaceOptions::builder().upsert(true).build();
        for row in rows {
            let filter = doc! { "_id": row.id.0 };
            if let Err(e) = self.table_schemas().replace_one(filter, row).with_options(upsert.clone()).await {
                tracing::warn!(error = %e, "partial failure upserting table schemas without a transaction");
                return Err(classify(e));
            }
        }
        let filter = doc! { "schemaName": &schema.schema_name, "schemaVersion": schema.schema_version.0 as i64 };
        self.schemas().replace_one(filter, schema).with_options(upsert).await.map_err(classify)?;
        Ok(())
    }
}
