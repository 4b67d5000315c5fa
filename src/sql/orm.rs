//! Declared type-to-table mappings and the statements derived from them.
//!
//! An ORM mapping is built once at sheet load from its declaration; the
//! derived CRUD statements require the table shape and are synthesized
//! lazily on first real use against a live connection. Generated
//! statements reference the persisted object's properties through the
//! `_this` base name so they flow through the ordinary builder path.

use crate::error::{DbError, DbResult};
use crate::sql::sheet::{BeforeStep, MappingDoc, OrmDoc};
use crate::sql::table::{ColumnToken, TableMeta};
use parking_lot::Mutex;

/// Base name the persisted object is registered under for generated
/// statements.
pub const OBJ_REF: &str = "_this";

/// One property-to-column pair.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub property: String,
    pub column: String,
}

/// Statements synthesized from the table shape plus declared mappings.
#[derive(Debug, Clone)]
pub struct DerivedSql {
    pub select: String,
    pub insert: String,
    pub update: String,
    pub delete: String,
    pub auto_increment: Vec<Mapping>,
}

/// The declared correspondence between a type and a table.
#[derive(Debug)]
pub struct OrmMapping {
    type_name: String,
    alias: Option<String>,
    table: Option<String>,
    mappings: Vec<Mapping>,
    before_insert: Vec<BeforeStep>,
    before_update: Vec<BeforeStep>,
    before_delete: Vec<BeforeStep>,
    derived: Mutex<Option<DerivedSql>>,
}

impl OrmMapping {
    pub fn from_doc(doc: OrmDoc, namespace: &str) -> DbResult<OrmMapping> {
        if doc.type_name.trim().is_empty() {
            return Err(DbError::configuration("orm declaration without a type"));
        }
        let mappings = doc
            .mappings
            .into_iter()
            .map(|MappingDoc { property, column }| Mapping { property, column })
            .collect::<Vec<_>>();
        if mappings.is_empty() {
            return Err(DbError::configuration(format!(
                "orm declaration for '{}' has no mappings",
                doc.type_name
            )));
        }

        let steps = |docs: Vec<crate::sql::sheet::StepDoc>| -> DbResult<Vec<BeforeStep>> {
            docs.into_iter()
                .map(|d| BeforeStep::from_doc(d, namespace).map(|s| s.prefix_targets(OBJ_REF)))
                .collect()
        };

        Ok(OrmMapping {
            type_name: doc.type_name,
            alias: doc.alias,
            table: doc.table,
            mappings,
            before_insert: steps(doc.before_insert)?,
            before_update: steps(doc.before_update)?,
            before_delete: steps(doc.before_delete)?,
            derived: Mutex::new(None),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn before_insert(&self) -> &[BeforeStep] {
        &self.before_insert
    }

    pub fn before_update(&self) -> &[BeforeStep] {
        &self.before_update
    }

    pub fn before_delete(&self) -> &[BeforeStep] {
        &self.before_delete
    }

    /// Column mapped to the property, if declared.
    pub fn column_for(&self, property: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.property == property)
            .map(|m| m.column.as_str())
    }

    /// Property mapped to the column, if declared. Case-insensitive on the
    /// column side, matching catalog behavior.
    pub fn property_for(&self, column: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.column.eq_ignore_ascii_case(column))
            .map(|m| m.property.as_str())
    }

    /// The derived statements, if already resolved.
    pub fn derived(&self) -> Option<DerivedSql> {
        self.derived.lock().clone()
    }

    /// Synthesizes the derived statements from the introspected table
    /// shape. Idempotent; the first resolution wins.
    pub fn resolve(&self, table: &TableMeta) -> DbResult<DerivedSql> {
        if let Some(derived) = self.derived.lock().clone() {
            return Ok(derived);
        }

        let mapping_for = |column: &crate::sql::table::ColumnMeta| -> DbResult<&Mapping> {
            self.mappings
                .iter()
                .find(|m| m.column.eq_ignore_ascii_case(&column.name))
                .ok_or_else(|| {
                    DbError::mapping("no property mapped to column", column.name.clone())
                })
        };

        // Every declared column must exist on the table.
        let mut specified: Vec<&crate::sql::table::ColumnMeta> = Vec::new();
        for mapping in &self.mappings {
            let column = table.column(&mapping.column).ok_or_else(|| {
                DbError::mapping(
                    format!(
                        "no column on table '{}' for declared property '{}'",
                        table.name(),
                        mapping.property
                    ),
                    mapping.column.clone(),
                )
            })?;
            specified.push(column);
        }

        let auto_increment = table
            .auto_increment()
            .into_iter()
            .map(|c| mapping_for(c).cloned())
            .collect::<DbResult<Vec<_>>>()?;

        let token_of = |column: &crate::sql::table::ColumnMeta| -> DbResult<ColumnToken> {
            Ok(ColumnToken {
                column: column.name.clone(),
                token: format!("#{{{}.{}}}", OBJ_REF, mapping_for(column)?.property),
            })
        };
        let tokens_of = |columns: &[&crate::sql::table::ColumnMeta]| -> DbResult<Vec<ColumnToken>> {
            columns.iter().map(|c| token_of(*c)).collect()
        };

        let keys: Vec<&crate::sql::table::ColumnMeta> =
            specified.iter().copied().filter(|c| c.key).collect();
        let non_keys: Vec<&crate::sql::table::ColumnMeta> =
            specified.iter().copied().filter(|c| !c.key).collect();

        let key_tokens = tokens_of(&keys)?;
        let derived = DerivedSql {
            insert: table.insert_sql(&tokens_of(&specified)?),
            update: table.update_sql(&tokens_of(&non_keys)?, &key_tokens),
            delete: table.delete_sql(&key_tokens),
            select: table
                .select_sql(&key_tokens)
                .replace(&format!("{OBJ_REF}."), ""),
            auto_increment,
        };

        *self.derived.lock() = Some(derived.clone());
        tracing::debug!(
            type_name = %self.type_name,
            table = table.name(),
            "orm statements derived"
        );
        Ok(derived)
    }
}
