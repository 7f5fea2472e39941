//! Module B — the Schema Inference Engine. Walks sampled documents and
//! projects their nested shape into base and virtual tables with a
//! deterministic type lattice and PK/FK wiring (spec §4.B).
//!
//! This generalizes the flat, single-level column typing loop in the
//! teacher's `engine/drivers/mongodb.rs::describe_table` into a recursive
//! walk that also materializes virtual tables for embedded documents and
//! arrays.

use std::collections::HashMap;

use mongodb::bson::{Bson, Document};

use crate::error::EngineResult;
use crate::lattice::promote;
use crate::types::{Column, DocType, RelationalType, TableId, TableSchema};

/// Default identifier-length budget (spec §9, open question 1): a
/// conservative cutoff past which the engine elides a path into a shorter
/// generated alias rather than emitting an unwieldy identifier.
pub const DEFAULT_IDENTIFIER_BUDGET: usize = 120;

fn qualify(collection_name: &str, path: &str) -> String {
    if path.is_empty() {
        collection_name.to_string()
    } else {
        format!("{collection_name}.{path}")
    }
}

fn to_name(qualified: &str) -> String {
    qualified.replace('.', "_")
}

fn as_inherited(pk_columns: &[Column], parent_table_name: &str) -> Vec<Column> {
    pk_columns
        .iter()
        .enumerate()
        .map(|(i, c)| Column {
            field_path: c.field_path.clone(),
            sql_name: c.sql_name.clone(),
            sql_type: c.sql_type,
            db_type: c.db_type,
            is_index: c.is_index,
            is_primary_key: true,
            primary_key_index: i as u32 + 1,
            foreign_key_table_name: Some(parent_table_name.to_string()),
            foreign_key_column_name: Some(c.sql_name.clone()),
            foreign_key_index: Some(i as u32 + 1),
            array_index_level: c.array_index_level,
            is_generated: c.is_generated,
            virtual_table_name: None,
        })
        .collect()
}

/// Recursive inference walker. One instance processes one collection's
/// sampled document sequence and yields `tableName -> TableSchema`.
pub struct InferenceEngine {
    tables: HashMap<String, TableSchema>,
    alias_map: HashMap<String, String>,
    array_state: HashMap<String, RelationalType>,
    id_budget: usize,
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine {
    pub fn new() -> Self {
        InferenceEngine {
            tables: HashMap::new(),
            alias_map: HashMap::new(),
            array_state: HashMap::new(),
            id_budget: DEFAULT_IDENTIFIER_BUDGET,
        }
    }

    pub fn with_identifier_budget(budget: usize) -> Self {
        InferenceEngine { id_budget: budget, ..Self::new() }
    }

    /// Process one collection's sampled documents into its full set of
    /// base + virtual tables. Any error from `documents` propagates
    /// unchanged (spec §4.B "Failure semantics").
    pub fn infer(
        mut self,
        collection_name: &str,
        documents: impl Iterator<Item = EngineResult<Document>>,
    ) -> EngineResult<HashMap<String, TableSchema>> {
        for doc in documents {
            let doc = doc?;
            self.visit_document(collection_name, "", &doc, &[], true)?;
            self.propagate_root_pk_type(collection_name);
        }
        self.finalize();
        Ok(self.tables)
    }

    fn resolve_name(&mut self, qualified: &str) -> String {
        if let Some(alias) = self.alias_map.get(qualified) {
            return alias.clone();
        }
        let name = to_name(qualified);
        if name.len() <= self.id_budget {
            return name;
        }
        let alias = format!("t_{}", self.alias_map.len());
        self.alias_map.insert(qualified.to_string(), alias.clone());
        alias
    }

    fn visit_document(
        &mut self,
        collection_name: &str,
        path: &str,
        doc: &Document,
        inherited_fks: &[Column],
        is_root: bool,
    ) -> EngineResult<()> {
        let qualified = qualify(collection_name, path);
        let mut table = match self.tables.remove(&qualified) {
            Some(t) => t,
            None => {
                let name = self.resolve_name(&qualified);
                let mut t = TableSchema::new(TableId::new(), name, collection_name.to_string());
                for fk in inherited_fks {
                    t.upsert_column(fk.clone());
                }
                t
            }
        };

        for (field_name, value) in doc.iter() {
            let field_path = if path.is_empty() {
                field_name.to_string()
            } else {
                format!("{path}.{field_name}")
            };
            let observed = DocType::of_bson(value);
            let prev_column = table.column(field_name).cloned();
            let prev_type = prev_column.as_ref().map(|c| c.sql_type).unwrap_or(RelationalType::Null);

            let mut next_type = promote(prev_type, observed);
            if is_root && field_name == "_id" && observed == DocType::Document {
                // The root _id is always serialized as a scalar, even when
                // sampled as an embedded document.
                next_type = RelationalType::Varchar;
            }

            let is_complex_now = matches!(next_type, RelationalType::Array | RelationalType::JavaObject);
            let was_complex = matches!(prev_type, RelationalType::Array | RelationalType::JavaObject);

            if is_complex_now && !matches!(value, Bson::Null) {
                let pk_columns = table.primary_key_columns_cloned();
                let inherited = as_inherited(&pk_columns, &table.sql_name);
                match (next_type, value) {
                    (RelationalType::JavaObject, Bson::Document(sub)) => {
                        self.visit_document(collection_name, &field_path, sub, &inherited, false)?;
                    }
                    (RelationalType::Array, Bson::Array(arr)) => {
                        self.visit_array(collection_name, field_name, &field_path, arr, &inherited, 0)?;
                    }
                    _ => {}
                }
            } else if was_complex {
                // Demotion from complex to scalar: the orphaned virtual
                // table (and anything nested under it) no longer applies.
                self.remove_subtree(&qualify(collection_name, &field_path));
            }

            let sql_name = if is_root && field_name == "_id" {
                format!("{collection_name}__id")
            } else {
                field_name.to_string()
            };
            let is_pk = is_root && field_name == "_id";
            let virtual_table_name = if is_complex_now {
                Some(self.resolve_name(&qualify(collection_name, &field_path)))
            } else {
                None
            };
            table.upsert_column(Column {
                field_path,
                sql_name,
                sql_type: next_type,
                db_type: observed,
                is_index: false,
                is_primary_key: is_pk,
                primary_key_index: if is_pk { 1 } else { 0 },
                foreign_key_table_name: None,
                foreign_key_column_name: None,
                foreign_key_index: None,
                array_index_level: None,
                is_generated: false,
                virtual_table_name,
            });
        }

        self.tables.insert(qualified, table);
        Ok(())
    }

    fn visit_array(
        &mut self,
        collection_name: &str,
        field_name: &str,
        path: &str,
        elements: &[Bson],
        inherited_fks: &[Column],
        level: u32,
    ) -> EngineResult<()> {
        let qualified = qualify(collection_name, path);
        // A collection named identically to one of its own top-level array
        // fields makes the bare field path textually equal to the root
        // table's qualified key ("tags" the field vs. "tags" the
        // collection's own table entry). Checking the unqualified `path`
        // against `self.tables` risked matching that unrelated root entry
        // and wrongly skipping the inherited PK/FK columns below, so this
        // checks the table's own qualified key instead — see
        // `inference::tests::collection_named_like_its_own_array_field_keeps_inherited_fk`.
        let fresh = !self.tables.contains_key(&qualified);

        let prior_state = self.array_state.get(&qualified).copied().unwrap_or(RelationalType::Null);
        let mut joined = prior_state;
        for el in elements {
            joined = promote(joined, DocType::of_bson(el));
        }
        let prior_was_complex = matches!(prior_state, RelationalType::Array | RelationalType::JavaObject);
        let now_is_complex = matches!(joined, RelationalType::Array | RelationalType::JavaObject);

        let mut table = match self.tables.remove(&qualified) {
            Some(t) => t,
            None => {
                let name = self.resolve_name(&qualified);
                TableSchema::new(TableId::new(), name, collection_name.to_string())
            }
        };

        if fresh {
            for fk in inherited_fks {
                if table.column(&fk.sql_name).is_none() {
                    table.upsert_column(fk.clone());
                }
            }
        }

        if prior_was_complex && !now_is_complex {
            // Complex-to-scalar conflict: drop whatever document-shaped
            // columns the previous (complex) observation had contributed.
            table.columns.retain(|c| c.is_primary_key || c.virtual_table_name.is_none() && c.field_path != path);
            table.rebuild_index();
        }

        if now_is_complex {
            table.remove_column("value");
        } else {
            // Array-level conflict: elements are no longer nested as deep
            // as a previous observation recorded; drop index columns for
            // levels deeper than this one.
            table.columns.retain(|c| !(c.is_generated && c.is_index && c.array_index_level.map(|l| l > level).unwrap_or(false)));
            table.rebuild_index();

            let last_doc_type = elements
                .iter()
                .rev()
                .map(DocType::of_bson)
                .find(|d| *d != DocType::Null)
                .unwrap_or(DocType::Null);
            table.upsert_column(Column {
                field_path: path.to_string(),
                sql_name: "value".to_string(),
                sql_type: joined,
                db_type: last_doc_type,
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
        }

        let index_name = format!("{field_name}_index_lvl_{level}");
        if table.column(&index_name).is_none() {
            let pk_index = table.primary_key_columns().len() as u32 + 1;
            table.upsert_column(Column {
                field_path: path.to_string(),
                sql_name: index_name,
                sql_type: RelationalType::Bigint,
                db_type: DocType::Int64,
                is_index: true,
                is_primary_key: true,
                primary_key_index: pk_index,
                foreign_key_table_name: None,
                foreign_key_column_name: None,
                foreign_key_index: None,
                array_index_level: Some(level),
                is_generated: true,
                virtual_table_name: None,
            });
        }

        self.array_state.insert(qualified.clone(), joined);
        self.tables.insert(qualified.clone(), table);

        match joined {
            RelationalType::JavaObject => {
                let pk_columns = self.tables[&qualified].primary_key_columns_cloned();
                let parent_name = self.tables[&qualified].sql_name.clone();
                let inherited = as_inherited(&pk_columns, &parent_name);
                for el in elements {
                    if let Bson::Document(d) = el {
                        self.visit_document(collection_name, path, d, &inherited, false)?;
                    }
                }
            }
            RelationalType::Array => {
                let pk_columns = self.tables[&qualified].primary_key_columns_cloned();
                let parent_name = self.tables[&qualified].sql_name.clone();
                let inherited = as_inherited(&pk_columns, &parent_name);
                for el in elements {
                    if let Bson::Array(inner) = el {
                        self.visit_array(collection_name, field_name, path, inner, &inherited, level + 1)?;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn remove_subtree(&mut self, prefix: &str) {
        let dotted = format!("{prefix}.");
        self.tables.retain(|key, _| key != prefix && !key.starts_with(&dotted));
    }

    fn propagate_root_pk_type(&mut self, collection_name: &str) {
        let root_qualified = qualify(collection_name, "");
        let pk_name = format!("{collection_name}__id");
        let Some(root_type) = self.tables.get(&root_qualified).and_then(|t| t.column(&pk_name)).map(|c| c.sql_type) else {
            return;
        };
        let prefix = format!("{collection_name}.");
        for (key, table) in self.tables.iter_mut() {
            if key == &root_qualified || !key.starts_with(&prefix) {
                continue;
            }
            if let Some(col) = table.column_mut(&pk_name) {
                col.sql_type = root_type;
            }
        }
    }

    /// Finalization (spec §4.B step 3): ARRAY/JAVA_OBJECT were bookkeeping
    /// placeholders for virtual-table edges; they must never survive on a
    /// returned column (testable property 3).
    fn finalize(&mut self) {
        for table in self.tables.values_mut() {
            table.columns.retain(|c| !c.sql_type.is_interim());
            table.rebuild_index();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn infer_one(collection: &str, docs: Vec<Document>) -> HashMap<String, TableSchema> {
        let engine = InferenceEngine::new();
        engine
            .infer(collection, docs.into_iter().map(Ok))
            .expect("inference over in-memory documents cannot fail")
    }

    #[test]
    fn s1_flat_document() {
        let tables = infer_one("products", vec![doc! { "_id": "a", "name": "x" }]);
        assert_eq!(tables.len(), 1);
        let t = &tables["products"];
        assert_eq!(t.columns.len(), 2);
        let pk = t.column("products__id").unwrap();
        assert!(pk.is_primary_key);
        assert_eq!(pk.sql_type, RelationalType::Varchar);
        let name = t.column("name").unwrap();
        assert_eq!(name.sql_type, RelationalType::Varchar);
    }

    #[test]
    fn s2_scalar_array_creates_virtual_table() {
        let tables = infer_one(
            "products",
            vec![
                doc! { "_id": "a", "name": "x" },
                doc! { "_id": "b", "tags": ["x", "y"] },
            ],
        );
        let tags = &tables["products.tags"];
        assert_eq!(tags.sql_name, "products_tags");
        let fk = tags.column("products__id").unwrap();
        assert!(fk.is_primary_key);
        assert_eq!(fk.foreign_key_table_name.as_deref(), Some("products"));
        let idx = tags.column("tags_index_lvl_0").unwrap();
        assert!(idx.is_primary_key && idx.is_generated && idx.is_index);
        assert_eq!(idx.array_index_level, Some(0));
        let value = tags.column("value").unwrap();
        assert_eq!(value.sql_type, RelationalType::Varchar);
        // The root table never keeps a placeholder ARRAY column for `tags`.
        assert!(tables["products"].column("tags").is_none());
    }

    #[test]
    fn s3_nested_array_folds_to_varchar_and_drops_value() {
        let tables = infer_one(
            "products",
            vec![
                doc! { "_id": "b", "tags": ["x", "y"] },
                doc! { "_id": "c", "tags": [["x"]] },
            ],
        );
        let tags = &tables["products.tags"];
        assert!(tags.column("value").is_none(), "value column must be dropped once nesting deepens");
        let lvl1 = tags.column("tags_index_lvl_1").unwrap();
        assert_eq!(lvl1.array_index_level, Some(1));
    }

    #[test]
    fn s4_numeric_widening_across_observations() {
        let tables = infer_one(
            "items",
            vec![
                doc! { "_id": "a", "qty": 1i32 },
                doc! { "_id": "b", "qty": 1i64 },
            ],
        );
        assert_eq!(tables["items"].column("qty").unwrap().sql_type, RelationalType::Bigint);

        let tables = infer_one(
            "items",
            vec![
                doc! { "_id": "a", "qty": 1i32 },
                doc! { "_id": "b", "qty": 1i64 },
                doc! { "_id": "c", "qty": 1.5f64 },
            ],
        );
        assert_eq!(tables["items"].column("qty").unwrap().sql_type, RelationalType::Decimal);
    }

    #[test]
    fn embedded_document_creates_virtual_table_with_fk() {
        let tables = infer_one(
            "orders",
            vec![doc! { "_id": "a", "shipping": { "city": "NYC", "zip": "10001" } }],
        );
        let shipping = &tables["orders.shipping"];
        assert_eq!(shipping.sql_name, "orders_shipping");
        assert!(shipping.column("orders__id").unwrap().is_primary_key);
        assert_eq!(shipping.column("city").unwrap().sql_type, RelationalType::Varchar);
        assert!(tables["orders"].column("shipping").is_none());
    }

    #[test]
    fn complex_to_scalar_demotion_drops_virtual_table() {
        let tables = infer_one(
            "orders",
            vec![
                doc! { "_id": "a", "note": { "text": "hi" } },
                doc! { "_id": "b", "note": "plain text" },
            ],
        );
        assert!(!tables.contains_key("orders.note"));
        assert_eq!(tables["orders"].column("note").unwrap().sql_type, RelationalType::Varchar);
    }

    #[test]
    fn finalization_never_leaves_interim_types() {
        let tables = infer_one(
            "orders",
            vec![doc! { "_id": "a", "shipping": { "city": "NYC" }, "tags": ["x"] }],
        );
        for table in tables.values() {
            for column in &table.columns {
                assert!(!column.sql_type.is_interim(), "column {} leaked an interim type", column.sql_name);
            }
        }
    }

    #[test]
    fn identifier_budget_elides_long_paths() {
        let engine = InferenceEngine::with_identifier_budget(20);
        let docs = vec![doc! { "_id": "a", "a_pretty_long_embedded_field_name": { "x": 1i32 } }];
        let tables = engine.infer("c", docs.into_iter().map(Ok)).unwrap();
        assert!(tables.keys().any(|k| k.starts_with("t_")));
    }

    #[test]
    fn shares_suffix_does_not_collide_in_practice() {
        // A bare field path only ever collides with another entry's
        // qualified key when that key has no dot, i.e. when the field
        // path textually equals some collection's own root table entry.
        // A path like "extra.tags" never matches a root key, so unrelated
        // branches of the tree never interfere with each other's
        // freshness checks.
        let tables = infer_one(
            "products",
            vec![
                doc! { "_id": "a", "tags": ["x"] },
                doc! { "_id": "b", "extra": { "tags": ["y"] } },
            ],
        );
        assert!(tables.contains_key("products.tags"));
        assert!(tables.contains_key("products.extra"));
        assert!(tables.contains_key("products.extra.tags"));
    }

    #[test]
    fn collection_named_like_its_own_array_field_keeps_inherited_fk() {
        // The one input shape where a bare field path *does* textually
        // equal a stored qualified key: a collection named identically to
        // one of its own top-level array fields. Before the freshness
        // check compared against the table's own qualified key, this
        // shape risked matching the collection's root table entry and
        // skipping the virtual table's inherited PK/FK column entirely.
        let tables = infer_one(
            "tags",
            vec![
                doc! { "_id": "1", "tags": ["x"] },
                doc! { "_id": "2", "tags": ["y"] },
            ],
        );
        let child = &tables["tags.tags"];
        let fk = child.column("tags__id").unwrap();
        assert!(fk.is_primary_key);
        assert_eq!(fk.foreign_key_table_name.as_deref(), Some("tags"));
    }
}
