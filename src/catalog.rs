//! Module E — the Catalog Adapter (spec §4.E). Exposes a `DatabaseSchemaMetadata`
//! as a flat relational catalog for the planner: one schema, one table per
//! `TableSchema`, columns reporting name, relational type and nullability.
//! This is the only place the planner is allowed to look at the schema —
//! it never sees `Column::db_type`, `field_path`, or anything else that
//! would leak the document model upward. Grounded on the teacher's
//! `federation/planner.rs::resolve_sources`, which performs the same
//! alias-to-table resolution against a flat name map instead of reaching
//! back into a live schema object.

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::types::{DatabaseSchemaMetadata, RelationalType, TableId, TableSchema};

/// One catalog-visible column. Nullability follows directly from the PK
/// invariant: a primary-key column can never hold a document that omits
/// the field (otherwise it could not have been selected as a key), so
/// `nullable` is `!is_primary_key`.
#[derive(Debug, Clone)]
pub struct CatalogColumn {
    pub name: String,
    pub sql_type: RelationalType,
    pub nullable: bool,
    pub primary_key_index: Option<u32>,
}

/// One catalog-visible table: a name the planner can reference in `FROM`,
/// plus the `TableId` needed to pull the full `TableSchema` back out when
/// lowering to a pipeline.
#[derive(Debug, Clone)]
pub struct CatalogTable {
    pub table_id: TableId,
    pub name: String,
    pub collection_name: String,
    pub columns: Vec<CatalogColumn>,
}

impl CatalogTable {
    pub fn column(&self, name: &str) -> Option<&CatalogColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        let mut pk: Vec<&CatalogColumn> = self.columns.iter().filter(|c| c.primary_key_index.is_some()).collect();
        pk.sort_by_key(|c| c.primary_key_index.unwrap());
        pk.into_iter().map(|c| c.name.as_str()).collect()
    }
}

fn catalog_column(table: &TableSchema) -> impl Fn(&crate::types::Column) -> CatalogColumn + '_ {
    move |c| CatalogColumn {
        name: c.sql_name.clone(),
        sql_type: c.sql_type,
        nullable: !c.is_primary_key,
        primary_key_index: (c.primary_key_index > 0).then_some(c.primary_key_index),
    }
}

fn catalog_table(table: &TableSchema) -> CatalogTable {
    CatalogTable {
        table_id: table.id,
        name: table.sql_name.clone(),
        collection_name: table.collection_name.clone(),
        columns: table.columns.iter().map(catalog_column(table)).collect(),
    }
}

/// A flat, name-indexed snapshot of one schema version's tables. Built once
/// per compile from a `DatabaseSchemaMetadata` so the planner never has to
/// drive the lazy loader itself.
pub struct Catalog {
    schema_name: String,
    tables: HashMap<String, CatalogTable>,
}

impl Catalog {
    /// Materializes every table referenced by `metadata` into the catalog.
    /// Spec §4.E calls for "one schema containing one table per
    /// `TableSchema`", so this eagerly resolves the full table list rather
    /// than lazily, trading the loader's laziness for a planner that can
    /// assume every name it sees is already resolvable.
    pub fn build(metadata: &mut DatabaseSchemaMetadata) -> Self {
        let ids: Vec<TableId> = metadata.all_table_ids().to_vec();
        let schema_name = metadata.schema.sql_name.clone();
        let tables = metadata.get_all(&ids);
        let tables = tables
            .into_iter()
            .map(|t| (t.sql_name.clone(), catalog_table(t)))
            .collect();
        Catalog { schema_name, tables }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table(&self, name: &str) -> EngineResult<&CatalogTable> {
        self.tables
            .get(name)
            .ok_or_else(|| EngineError::query_compile_error(format!("unknown table '{name}'")))
    }

    /// Tables sharing a base collection are exactly the ones a same-collection
    /// join (spec §4.F) is allowed to push down as a `$lookup` on the shared
    /// primary key, since they are views over the same physical documents.
    pub fn share_base_collection(&self, left: &str, right: &str) -> bool {
        match (self.tables.get(left), self.tables.get(right)) {
            (Some(l), Some(r)) => l.collection_name == r.collection_name,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, DatabaseSchema, DocType, SchemaVersion, TableLoader};

    struct StaticLoader(Vec<TableSchema>);
    impl TableLoader for StaticLoader {
        fn get(&self, id: TableId) -> Option<TableSchema> {
            self.0.iter().find(|t| t.id == id).cloned()
        }
        fn get_all(&self, ids: &[TableId]) -> Vec<TableSchema> {
            ids.iter().filter_map(|&id| self.get(id)).collect()
        }
    }

    fn pk_column(sql_name: &str) -> Column {
        Column {
            field_path: "_id".into(),
            sql_name: sql_name.into(),
            sql_type: RelationalType::Varchar,
            db_type: DocType::String,
            is_index: false,
            is_primary_key: true,
            primary_key_index: 1,
            foreign_key_table_name: None,
            foreign_key_column_name: None,
            foreign_key_index: None,
            array_index_level: None,
            is_generated: false,
            virtual_table_name: None,
        }
    }

    #[test]
    fn exposes_tables_and_nullability() {
        let mut orders = TableSchema::new(TableId::new(), "orders", "orders");
        orders.upsert_column(pk_column("orders__id"));
        orders.upsert_column(Column {
            field_path: "total".into(),
            sql_name: "total".into(),
            sql_type: RelationalType::Double,
            db_type: DocType::Double,
            is_index: false,
            is_primary_key: false,
            primary_key_index: 0,
            foreign_key_table_name: None,
            foreign_key_column_name: None,
            foreign_key_index: None,
            array_index_level: None,
            is_generated: false,
            virtual_table_name: None,
        });
        let ids = vec![orders.id];

        let schema = DatabaseSchema {
            schema_name: "_default".into(),
            schema_version: SchemaVersion::INITIAL,
            sql_name: "mydb".into(),
            modify_date: chrono::Utc::now(),
            table_references: ids.clone(),
        };
        let mut metadata = DatabaseSchemaMetadata::new(schema, Box::new(StaticLoader(vec![orders])));
        let catalog = Catalog::build(&mut metadata);

        let t = catalog.table("orders").unwrap();
        assert_eq!(t.primary_key_names(), vec!["orders__id"]);
        assert!(!t.column("orders__id").unwrap().nullable);
        assert!(t.column("total").unwrap().nullable);
        assert!(catalog.table("missing").is_err());
    }

    #[test]
    fn same_collection_tables_share_base_collection() {
        let base = TableSchema::new(TableId::new(), "orders", "orders");
        let mut virt = TableSchema::new(TableId::new(), "orders_items", "orders");
        virt.upsert_column(pk_column("orders_items_index_lvl_0"));
        let ids = vec![base.id, virt.id];
        let schema = DatabaseSchema {
            schema_name: "_default".into(),
            schema_version: SchemaVersion::INITIAL,
            sql_name: "mydb".into(),
            modify_date: chrono::Utc::now(),
            table_references: ids,
        };
        let mut metadata = DatabaseSchemaMetadata::new(schema, Box::new(StaticLoader(vec![base, virt])));
        let catalog = Catalog::build(&mut metadata);
        assert!(catalog.share_base_collection("orders", "orders_items"));
    }
}
