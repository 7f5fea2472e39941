//! Module H — the Query Context (spec §4.H), and the `compile` entry point
//! that threads the whole pipeline together: catalog → planner → lowerer.
//! `ColumnDescriptor` generalizes the teacher's
//! `engine/types.rs::ColumnInfo` (name + type + nullability) with the
//! precision/scale pair relational result-set consumers expect.

use mongodb::bson::Document;

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::PipelineLowerer;
use crate::planner::{AggFunc, PlannerDriver, Projection};
use crate::session::CorrelationTag;
use crate::types::{DatabaseSchemaMetadata, RelationalType, TableSchema};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub label: String,
    pub sql_type: RelationalType,
    pub nullable: bool,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// DECIMAL is the only relational type this engine ever reports with
/// nonzero scale; every other type carries `None` for both fields.
fn descriptor_for(label: &str, sql_type: RelationalType, nullable: bool) -> ColumnDescriptor {
    let (precision, scale) = match sql_type {
        RelationalType::Decimal => (Some(34), Some(6)),
        _ => (None, None),
    };
    ColumnDescriptor { label: label.to_string(), sql_type, nullable, precision, scale }
}

fn column_descriptors(catalog: &Catalog, table_name: &str, projection: &Projection) -> EngineResult<Vec<ColumnDescriptor>> {
    let table = catalog.table(table_name)?;
    match projection {
        Projection::Columns(columns) => columns
            .iter()
            .map(|p| {
                let col = table.column(&p.name).ok_or_else(|| EngineError::query_compile_error(format!("unknown column '{}'", p.name)))?;
                let label = p.alias.clone().unwrap_or_else(|| p.name.clone());
                Ok(descriptor_for(&label, col.sql_type, col.nullable))
            })
            .collect(),
        Projection::Aggregate { group_by, items } => {
            let mut out = Vec::with_capacity(group_by.len() + items.len());
            for g in group_by {
                let col = table.column(g).ok_or_else(|| EngineError::query_compile_error(format!("unknown column '{g}'")))?;
                out.push(descriptor_for(g, col.sql_type, col.nullable));
            }
            for item in items {
                let sql_type = match item.func {
                    AggFunc::Count => RelationalType::Bigint,
                    AggFunc::Sum | AggFunc::Avg => RelationalType::Double,
                    AggFunc::Min | AggFunc::Max => item
                        .column
                        .as_deref()
                        .and_then(|c| table.column(c))
                        .map(|c| c.sql_type)
                        .unwrap_or(RelationalType::Double),
                };
                out.push(descriptor_for(&item.alias, sql_type, true));
            }
            Ok(out)
        }
    }
}

/// The sole output of the compiler (spec §4.H). Execution against
/// `pipeline` is the job of an external collaborator this crate never
/// implements.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub collection_name: String,
    pub pipeline: Vec<Document>,
    pub columns: Vec<ColumnDescriptor>,
    pub table: TableSchema,
    /// Threaded through to the `comment` option on the eventual
    /// `aggregate` call, so a `QuerySession` can correlate an in-flight
    /// execution back to this compilation for cancellation (spec §5).
    pub correlation_tag: CorrelationTag,
}

/// Compiles `sql` against the tables reachable from `metadata` into a
/// `QueryContext`. This is the composition root for Modules E through H:
/// build the catalog, run the planner, resolve the scanned (and optionally
/// joined) `TableSchema`, lower to a pipeline.
pub fn compile(sql: &str, metadata: &mut DatabaseSchemaMetadata) -> EngineResult<QueryContext> {
    let catalog = Catalog::build(metadata);
    let plan = PlannerDriver::compile(sql, &catalog)?;

    let table_id = catalog.table(&plan.table)?.table_id;
    let joined_id = match &plan.join {
        Some(join) if join.pushable => Some(catalog.table(&join.right_table)?.table_id),
        _ => None,
    };

    let columns = column_descriptors(&catalog, &plan.table, &plan.projection)?;
    let collection_name = catalog.table(&plan.table)?.collection_name.clone();

    let table = metadata
        .get(table_id)
        .cloned()
        .ok_or_else(|| EngineError::internal(format!("table '{}' missing from loader after catalog resolution", plan.table)))?;
    let joined_table = match joined_id {
        Some(id) => Some(
            metadata
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::internal("joined table missing from loader after catalog resolution"))?,
        ),
        None => None,
    };

    let pipeline = PipelineLowerer::lower(&plan, &table, joined_table.as_ref(), &catalog)?;

    Ok(QueryContext { collection_name, pipeline, columns, table, correlation_tag: CorrelationTag::new() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, DatabaseSchema, DocType, SchemaVersion, TableId, TableLoader};

    struct StaticLoader(Vec<TableSchema>);
    impl TableLoader for StaticLoader {
        fn get(&self, id: TableId) -> Option<TableSchema> {
            self.0.iter().find(|t| t.id == id).cloned()
        }
        fn get_all(&self, ids: &[TableId]) -> Vec<TableSchema> {
            ids.iter().filter_map(|&id| self.get(id)).collect()
        }
    }

    fn column(field_path: &str, sql_name: &str, sql_type: RelationalType, is_pk: bool) -> Column {
        Column {
            field_path: field_path.into(),
            sql_name: sql_name.into(),
            sql_type,
            db_type: DocType::String,
            is_index: false,
            is_primary_key: is_pk,
            primary_key_index: if is_pk { 1 } else { 0 },
            foreign_key_table_name: None,
            foreign_key_column_name: None,
            foreign_key_index: None,
            array_index_level: None,
            is_generated: false,
            virtual_table_name: None,
        }
    }

    fn metadata_with_orders() -> DatabaseSchemaMetadata {
        let mut orders = TableSchema::new(TableId::new(), "orders", "orders");
        orders.upsert_column(column("_id", "orders__id", RelationalType::Varchar, true));
        orders.upsert_column(column("total", "total", RelationalType::Decimal, false));
        orders.upsert_column(column("status", "status", RelationalType::Varchar, false));
        let ids = vec![orders.id];
        let schema = DatabaseSchema {
            schema_name: "_default".into(),
            schema_version: SchemaVersion::INITIAL,
            sql_name: "mydb".into(),
            modify_date: chrono::Utc::now(),
            table_references: ids,
        };
        DatabaseSchemaMetadata::new(schema, Box::new(StaticLoader(vec![orders])))
    }

    #[test]
    fn compiles_to_pipeline_with_descriptors() {
        let mut metadata = metadata_with_orders();
        let ctx = compile("SELECT status, total FROM orders WHERE status = 'open'", &mut metadata).unwrap();
        assert_eq!(ctx.collection_name, "orders");
        assert_eq!(ctx.columns.len(), 2);
        assert_eq!(ctx.columns[1].sql_type, RelationalType::Decimal);
        assert_eq!(ctx.columns[1].precision, Some(34));
        assert!(ctx.pipeline.iter().any(|s| s.contains_key("$match")));
        assert!(ctx.pipeline.iter().any(|s| s.contains_key("$project")));
    }

    #[test]
    fn unknown_column_in_projection_errors() {
        let mut metadata = metadata_with_orders();
        assert!(compile("SELECT missing_col FROM orders", &mut metadata).is_err());
    }
}
