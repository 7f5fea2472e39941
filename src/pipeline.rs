//! Module G — the Pipeline Lowerer (spec §4.G). Turns a `PhysicalPlan` plus
//! its scanned `TableSchema` into an ordered `Vec<Document>` of aggregation
//! stages. Grounded on the teacher's `engine/drivers/mongodb.rs::query_table`,
//! which builds the same `$match`/`$sort` shapes one operator at a time with
//! `bson::doc!` rather than a query builder crate.

use mongodb::bson::{doc, oid::ObjectId, Bson, Document};

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::planner::{AggFunc, CompareOp, JoinPushdown, Literal, PhysicalPlan, Predicate, Projection};
use crate::types::{Column, TableSchema};

fn literal_bson(lit: &Literal) -> Bson {
    match lit {
        Literal::Null => Bson::Null,
        Literal::Bool(b) => Bson::Boolean(*b),
        Literal::Int(i) => Bson::Int64(*i),
        Literal::Float(f) => Bson::Double(*f),
        Literal::Str(s) => Bson::String(s.clone()),
    }
}

fn scalar_condition(op: CompareOp, value: &Literal) -> Bson {
    let v = literal_bson(value);
    match op {
        CompareOp::Eq => v,
        CompareOp::NotEq => Bson::Document(doc! { "$ne": v }),
        CompareOp::Lt => Bson::Document(doc! { "$lt": v }),
        CompareOp::LtEq => Bson::Document(doc! { "$lte": v }),
        CompareOp::Gt => Bson::Document(doc! { "$gt": v }),
        CompareOp::GtEq => Bson::Document(doc! { "$gte": v }),
    }
}

fn is_object_id_hex(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Spec §4.G.5: a string literal compared against the `_id` column that
/// looks like a 24-hex-digit ObjectId is expanded into a disjunction so
/// that collections keyed by either an ObjectId or a string primary key
/// both match. Only `=` is expanded; a disjunction of two `$ne` clauses
/// would not express "not equal to either representation" correctly, so
/// `<>` against `_id` falls back to a plain string comparison.
fn id_equality_clause(field: &str, value: &Literal) -> Option<Document> {
    let Literal::Str(s) = value else { return None };
    if !is_object_id_hex(s) {
        return None;
    }
    let oid = ObjectId::parse_str(s).ok()?;
    Some(doc! {
        "$or": [
            doc! { field: { "$eq": oid } },
            doc! { field: { "$eq": s.clone() } },
        ]
    })
}

fn column_field<'a>(table: &'a TableSchema, sql_name: &str) -> EngineResult<&'a Column> {
    table
        .column(sql_name)
        .ok_or_else(|| EngineError::query_compile_error(format!("unknown column '{sql_name}'")))
}

fn predicate_clause(table: &TableSchema, predicate: &Predicate) -> EngineResult<Document> {
    match predicate {
        Predicate::Compare { column, op, value } => {
            let col = column_field(table, column)?;
            if col.field_path == "_id" && *op == CompareOp::Eq {
                if let Some(clause) = id_equality_clause(&col.field_path, value) {
                    return Ok(clause);
                }
            }
            Ok(doc! { col.field_path.clone(): scalar_condition(*op, value) })
        }
        Predicate::IsNull(column) => {
            let col = column_field(table, column)?;
            Ok(doc! { col.field_path.clone(): { "$eq": Bson::Null } })
        }
        Predicate::IsNotNull(column) => {
            let col = column_field(table, column)?;
            Ok(doc! { col.field_path.clone(): { "$ne": Bson::Null } })
        }
    }
}

fn match_stage(table: &TableSchema, predicates: &[Predicate]) -> EngineResult<Document> {
    let mut clauses = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        clauses.push(predicate_clause(table, predicate)?);
    }
    let filter = match clauses.len() {
        0 => Document::new(),
        1 => clauses.into_iter().next().unwrap(),
        _ => doc! { "$and": clauses },
    };
    Ok(doc! { "$match": filter })
}

/// Step 1: unwind every array-origin-index column outermost first, so a
/// doubly-nested array unwinds its outer level before its inner one.
/// Takes every table folded into this scan (the literal FROM table, plus
/// any pushable-joined virtual table over the same collection) so a
/// same-collection join reuses the unwind the array already needs instead
/// of a second pass over the documents; a field path already unwound by
/// an earlier table is not unwound twice.
fn unwind_stages(tables: &[&TableSchema]) -> Vec<Document> {
    let mut seen = std::collections::HashSet::new();
    let mut index_columns: Vec<&Column> = Vec::new();
    for table in tables {
        for c in table.columns.iter().filter(|c| c.array_index_level.is_some()) {
            if seen.insert(c.field_path.clone()) {
                index_columns.push(c);
            }
        }
    }
    index_columns.sort_by_key(|c| c.array_index_level.unwrap());
    index_columns
        .into_iter()
        .map(|c| {
            doc! {
                "$unwind": {
                    "path": format!("${}", c.field_path),
                    "includeArrayIndex": c.sql_name.clone(),
                    "preserveNullAndEmptyArrays": true,
                }
            }
        })
        .collect()
}

/// A table is virtual when its SQL name departs from its base collection —
/// the inference engine only ever names a table after its collection
/// verbatim for the root table (spec §4.B).
fn is_virtual_table(table: &TableSchema) -> bool {
    table.sql_name != table.collection_name
}

/// Step 2: virtual tables require every non-generated column path to exist
/// on the parent document, otherwise a row with no embedded value at all
/// would still surface as a single all-null row.
fn existence_stage(table: &TableSchema) -> Option<Document> {
    if !is_virtual_table(table) {
        return None;
    }
    let conditions: Vec<Document> = table
        .columns
        .iter()
        .filter(|c| !c.is_generated)
        .map(|c| doc! { c.field_path.clone(): { "$exists": true } })
        .collect();
    if conditions.is_empty() {
        return None;
    }
    Some(doc! { "$match": { "$and": conditions } })
}

/// A pushable join is only ever a base table joined back to a virtual
/// table derived from one of its own arrays (or two such virtual tables),
/// so both sides of the `ON` equality must be the primary key the child
/// inherited from its parent (spec §4.G scenario S6): the rows are already
/// sitting in the same document, so there is nothing to look up. Anything
/// else that happened to share a base collection but compare non-key
/// columns would not actually line parent and child rows up correctly.
fn validate_pushable_join(join: &JoinPushdown, table: &TableSchema, right_table: &TableSchema) -> EngineResult<()> {
    let left = column_field(table, &join.left_key)?;
    let right = column_field(right_table, &join.right_key)?;
    if !left.is_primary_key || !right.is_primary_key {
        return Err(EngineError::query_compile_error(format!(
            "same-collection join requires both sides to compare primary keys, got '{}' = '{}'",
            join.left_key, join.right_key
        )));
    }
    Ok(())
}

fn sort_stage(sort: &[crate::planner::SortKey], table: &TableSchema) -> EngineResult<Document> {
    let mut sort_doc = Document::new();
    for key in sort {
        let col = column_field(table, &key.column)?;
        sort_doc.insert(col.field_path.clone(), if key.ascending { 1 } else { -1 });
    }
    Ok(doc! { "$sort": sort_doc })
}

fn project_stage(table: &TableSchema, columns: &[crate::planner::ProjectedColumn]) -> EngineResult<Document> {
    let mut projection = Document::new();
    projection.insert("_id", 0);
    for projected in columns {
        let col = column_field(table, &projected.name)?;
        let out_name = projected.alias.clone().unwrap_or_else(|| projected.name.clone());
        projection.insert(out_name, format!("${}", col.field_path));
    }
    Ok(doc! { "$project": projection })
}

fn group_accumulator(func: AggFunc) -> &'static str {
    match func {
        AggFunc::Count => "$sum",
        AggFunc::Sum => "$sum",
        AggFunc::Avg => "$avg",
        AggFunc::Min => "$min",
        AggFunc::Max => "$max",
    }
}

fn group_stages(table: &TableSchema, group_by: &[String], items: &[crate::planner::AggregateItem]) -> EngineResult<Vec<Document>> {
    let mut group_id = Document::new();
    for g in group_by {
        let col = column_field(table, g)?;
        group_id.insert(g.clone(), format!("${}", col.field_path));
    }
    let mut group_doc = Document::new();
    group_doc.insert("_id", if group_by.is_empty() { Bson::Null } else { Bson::Document(group_id) });
    for item in items {
        let expr = match item.func {
            AggFunc::Count => Bson::Int32(1),
            _ => {
                let name = item.column.as_deref().ok_or_else(|| {
                    EngineError::query_compile_error(format!("aggregate '{}' requires a column argument", item.alias))
                })?;
                let col = column_field(table, name)?;
                Bson::String(format!("${}", col.field_path))
            }
        };
        group_doc.insert(item.alias.clone(), doc! { group_accumulator(item.func): expr });
    }

    let mut post_project = Document::new();
    post_project.insert("_id", 0);
    for g in group_by {
        post_project.insert(g.clone(), format!("$_id.{g}"));
    }
    for item in items {
        post_project.insert(item.alias.clone(), 1);
    }

    Ok(vec![doc! { "$group": group_doc }, doc! { "$project": post_project }])
}

pub struct PipelineLowerer;

impl PipelineLowerer {
    /// Lowers `plan` against the catalog it was compiled from. `catalog` is
    /// only needed to resolve the joined table's schema when `plan.join`
    /// is pushable; the scanned table's own schema is pulled in separately
    /// because the catalog adapter intentionally does not expose full
    /// `TableSchema` values (spec §4.E).
    pub fn lower(plan: &PhysicalPlan, table: &TableSchema, joined_table: Option<&TableSchema>, _catalog: &Catalog) -> EngineResult<Vec<Document>> {
        let mut scan_tables: Vec<&TableSchema> = vec![table];
        if let Some(join) = &plan.join {
            if join.pushable {
                let right = joined_table
                    .ok_or_else(|| EngineError::internal("pushable join requires the joined table's schema"))?;
                validate_pushable_join(join, table, right)?;
                scan_tables.push(right);
            }
        }

        // Same-base-collection joins never emit `$lookup` (spec §8 S6):
        // both sides are views over the same documents, so folding the
        // right-hand virtual table's own unwind/existence stages into this
        // single pipeline already produces the joined rows.
        let mut stages = unwind_stages(&scan_tables);

        for scanned in &scan_tables {
            if let Some(stage) = existence_stage(scanned) {
                stages.push(stage);
            }
        }

        if !plan.filters.is_empty() {
            stages.push(match_stage(table, &plan.filters)?);
        }

        if !plan.sort.is_empty() {
            stages.push(sort_stage(&plan.sort, table)?);
        }

        match &plan.projection {
            Projection::Columns(columns) => stages.push(project_stage(table, columns)?),
            Projection::Aggregate { group_by, items } => stages.extend(group_stages(table, group_by, items)?),
        }

        if let Some(offset) = plan.offset {
            stages.push(doc! { "$skip": offset as i64 });
        }
        if let Some(limit) = plan.limit {
            stages.push(doc! { "$limit": limit as i64 });
        }

        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::planner::{PlannerDriver, SortKey};
    use crate::types::{DatabaseSchema, DatabaseSchemaMetadata, DocType, RelationalType, SchemaVersion, TableId, TableLoader};

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

    fn orders_table() -> TableSchema {
        let mut orders = TableSchema::new(TableId::new(), "orders", "orders");
        orders.upsert_column(column("_id", "orders__id", RelationalType::Varchar, true));
        orders.upsert_column(column("total", "total", RelationalType::Double, false));
        orders.upsert_column(column("status", "status", RelationalType::Varchar, false));
        orders
    }

    fn build_catalog(tables: Vec<TableSchema>) -> (Catalog, Vec<TableSchema>) {
        let ids = tables.iter().map(|t| t.id).collect();
        let schema = DatabaseSchema {
            schema_name: "_default".into(),
            schema_version: SchemaVersion::INITIAL,
            sql_name: "mydb".into(),
            modify_date: chrono::Utc::now(),
            table_references: ids,
        };
        let mut metadata = DatabaseSchemaMetadata::new(schema, Box::new(StaticLoader(tables.clone())));
        (Catalog::build(&mut metadata), tables)
    }

    #[test]
    fn simple_select_produces_match_project_stages() {
        let orders = orders_table();
        let (catalog, tables) = build_catalog(vec![orders]);
        let plan = PlannerDriver::compile("SELECT status, total FROM orders WHERE status = 'open' ORDER BY total DESC LIMIT 5", &catalog).unwrap();
        let stages = PipelineLowerer::lower(&plan, &tables[0], None, &catalog).unwrap();

        assert!(stages[0].get_document("$match").unwrap().contains_key("status"));
        assert!(stages.iter().any(|s| s.contains_key("$sort")));
        assert!(stages.iter().any(|s| s.contains_key("$project")));
        assert_eq!(stages.last().unwrap().get_i64("$limit").unwrap(), 5);
    }

    #[test]
    fn object_id_equality_expands_to_disjunction() {
        let orders = orders_table();
        let (catalog, tables) = build_catalog(vec![orders]);
        let plan = PlannerDriver::compile("SELECT status FROM orders WHERE orders__id = '507f1f77bcf86cd799439011'", &catalog).unwrap();
        let stages = PipelineLowerer::lower(&plan, &tables[0], None, &catalog).unwrap();
        let filter = stages[0].get_document("$match").unwrap();
        let or_clauses = filter.get_array("$or").unwrap();
        assert_eq!(or_clauses.len(), 2);
    }

    #[test]
    fn virtual_table_gets_existence_match() {
        let mut tags = TableSchema::new(TableId::new(), "orders_tags", "orders");
        tags.upsert_column(column("_id", "orders__id", RelationalType::Varchar, true));
        tags.upsert_column(column("tags", "tags_index_lvl_0", RelationalType::Bigint, true));
        tags.column_mut("tags_index_lvl_0").unwrap().array_index_level = Some(0);
        tags.column_mut("tags_index_lvl_0").unwrap().is_generated = true;
        tags.upsert_column(column("tags", "value", RelationalType::Varchar, false));

        let (catalog, tables) = build_catalog(vec![tags]);
        let plan = PlannerDriver::compile("SELECT value FROM orders_tags", &catalog).unwrap();
        let stages = PipelineLowerer::lower(&plan, &tables[0], None, &catalog).unwrap();

        assert!(stages[0].contains_key("$unwind"));
        let existence = stages.iter().find(|s| s.get_document("$match").map(|m| m.contains_key("$and")).unwrap_or(false));
        assert!(existence.is_some());
    }

    #[test]
    fn aggregate_projection_emits_group_then_project() {
        let orders = orders_table();
        let (catalog, tables) = build_catalog(vec![orders]);
        let plan = PlannerDriver::compile("SELECT status, COUNT(*) AS n FROM orders GROUP BY status", &catalog).unwrap();
        let stages = PipelineLowerer::lower(&plan, &tables[0], None, &catalog).unwrap();
        let group_index = stages.iter().position(|s| s.contains_key("$group")).unwrap();
        assert!(stages[group_index + 1].contains_key("$project"));
    }

    /// spec §8 S6: a same-base-collection join folds the child virtual
    /// table's own unwind into the single pipeline on `orders` — no
    /// `$lookup` is ever emitted, since the "joined" rows already live in
    /// the same document as an embedded array.
    #[test]
    fn pushable_join_folds_unwind_without_lookup() {
        let orders = orders_table();
        let mut items = TableSchema::new(TableId::new(), "orders_items", "orders");
        items.upsert_column(column("_id", "orders__id", RelationalType::Varchar, true));
        items.upsert_column(column("items", "items_index_lvl_0", RelationalType::Bigint, true));
        items.column_mut("items_index_lvl_0").unwrap().array_index_level = Some(0);
        items.column_mut("items_index_lvl_0").unwrap().is_generated = true;
        items.upsert_column(column("items.sku", "sku", RelationalType::Varchar, false));

        let (catalog, tables) = build_catalog(vec![orders, items]);
        let plan = PlannerDriver::compile(
            "SELECT * FROM orders JOIN orders_items ON orders.orders__id = orders_items.orders__id",
            &catalog,
        )
        .unwrap();
        let stages = PipelineLowerer::lower(&plan, &tables[0], Some(&tables[1]), &catalog).unwrap();

        assert!(!stages.iter().any(|s| s.contains_key("$lookup")));
        let unwind = stages[0].get_document("$unwind").unwrap();
        assert_eq!(unwind.get_str("path").unwrap(), "$items");
    }

    #[test]
    fn pushable_join_rejects_non_key_condition() {
        let orders = orders_table();
        let mut items = TableSchema::new(TableId::new(), "orders_items", "orders");
        items.upsert_column(column("_id", "orders__id", RelationalType::Varchar, true));
        items.upsert_column(column("sku", "sku", RelationalType::Varchar, false));
        let (catalog, tables) = build_catalog(vec![orders, items]);
        let plan = PlannerDriver::compile(
            "SELECT * FROM orders JOIN orders_items ON orders.total = orders_items.sku",
            &catalog,
        )
        .unwrap();
        assert!(PipelineLowerer::lower(&plan, &tables[0], Some(&tables[1]), &catalog).is_err());
    }

    #[test]
    #[allow(unused_variables)]
    fn sort_key_equality_used_in_planner_tests() {
        let _ = SortKey { column: "x".into(), ascending: true };
    }
}
