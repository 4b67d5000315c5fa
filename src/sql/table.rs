//! Table metadata introspection and CRUD statement synthesis.
//!
//! On first use per table name, the column names, primary-key membership,
//! and auto-increment flags are read from the database catalog. The
//! metadata then drives statement synthesis for the ORM layer: every
//! generated statement uses the same `#{}` token convention, so it
//! round-trips through the SQL builder unmodified.

use crate::db::connection::{Backend, DbConnection};
use crate::error::{DbError, DbResult};

/// One column of an introspected table.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub key: bool,
    pub auto_increment: bool,
}

/// Introspected table shape, cached process-wide per table name.
#[derive(Debug, Clone)]
pub struct TableMeta {
    name: String,
    columns: Vec<ColumnMeta>,
}

/// A column paired with the token to emit for its value slot.
#[derive(Debug, Clone)]
pub struct ColumnToken {
    pub column: String,
    pub token: String,
}

// Catalog queries per backend. MySQL and PostgreSQL read
// information_schema the way the system catalogs expose it; SQLite goes
// through PRAGMA table_info plus the declared DDL for AUTOINCREMENT.
mod queries {
    pub mod postgres {
        pub const COLUMNS: &str = r#"
        SELECT
            c.column_name,
            CASE WHEN pk.column_name IS NOT NULL THEN true ELSE false END AS is_primary_key,
            CASE WHEN c.column_default LIKE 'nextval%' OR c.is_identity = 'YES'
                 THEN true ELSE false END AS is_auto_increment
        FROM information_schema.columns c
        LEFT JOIN (
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_name = $1
            AND tc.table_schema = $2
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_name = $1 AND c.table_schema = $2
        ORDER BY c.ordinal_position
        "#;
    }

    pub mod mysql {
        pub const COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8) AS column_name,
            COLUMN_KEY = 'PRI' AS is_primary_key,
            EXTRA LIKE '%auto_increment%' AS is_auto_increment
        FROM information_schema.COLUMNS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        ORDER BY ORDINAL_POSITION
        "#;
    }

    pub mod sqlite {
        pub const TABLE_DDL: &str =
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?";
    }
}

impl TableMeta {
    /// Reads the table shape from the live connection's catalog.
    pub async fn introspect(
        conn: &mut DbConnection,
        name: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
    ) -> DbResult<TableMeta> {
        let columns = match conn.backend() {
            Backend::Postgres => {
                let schema = schema.unwrap_or("public");
                let rows = conn
                    .fetch(
                        queries::postgres::COLUMNS,
                        &[name.into(), schema.into()],
                    )
                    .await?;
                rows.iter()
                    .map(|row| ColumnMeta {
                        name: string_of(row.get("column_name")),
                        key: bool_of(row.get("is_primary_key")),
                        auto_increment: bool_of(row.get("is_auto_increment")),
                    })
                    .collect()
            }
            Backend::MySql => {
                let db = catalog.or(schema);
                let rows = conn
                    .fetch(
                        queries::mysql::COLUMNS,
                        &[name.into(), db.map(Into::into).unwrap_or(serde_json::Value::Null)],
                    )
                    .await?;
                rows.iter()
                    .map(|row| ColumnMeta {
                        name: string_of(row.get("column_name")),
                        key: bool_of(row.get("is_primary_key")),
                        auto_increment: bool_of(row.get("is_auto_increment")),
                    })
                    .collect()
            }
            Backend::Sqlite => Self::introspect_sqlite(conn, name).await?,
        };

        if columns.is_empty() {
            return Err(DbError::mapping("table not found or empty", name));
        }
        tracing::debug!(table = name, columns = columns.len(), "table introspected");
        Ok(TableMeta {
            name: name.to_string(),
            columns,
        })
    }

    async fn introspect_sqlite(
        conn: &mut DbConnection,
        name: &str,
    ) -> DbResult<Vec<ColumnMeta>> {
        // PRAGMA does not take bind parameters; the identifier is quoted.
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let rows = conn.fetch(&pragma, &[]).await?;

        let ddl_rows = conn
            .fetch(queries::sqlite::TABLE_DDL, &[name.into()])
            .await?;
        let ddl = ddl_rows
            .first()
            .map(|r| string_of(r.get("sql")).to_uppercase())
            .unwrap_or_default();
        let declared_autoinc = ddl.contains("AUTOINCREMENT");

        let pk_count = rows.iter().filter(|r| bool_of(r.get("pk"))).count();
        Ok(rows
            .iter()
            .map(|row| {
                let name = string_of(row.get("name"));
                let key = bool_of(row.get("pk"));
                let col_type = string_of(row.get("type")).to_uppercase();
                // A single INTEGER primary key is a rowid alias, which the
                // engine fills like an auto-increment column.
                let auto_increment =
                    key && pk_count == 1 && col_type == "INTEGER" || key && declared_autoinc;
                ColumnMeta {
                    name,
                    key,
                    auto_increment,
                }
            })
            .collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn keys(&self) -> Vec<&ColumnMeta> {
        self.columns.iter().filter(|c| c.key).collect()
    }

    pub fn auto_increment(&self) -> Vec<&ColumnMeta> {
        self.columns.iter().filter(|c| c.auto_increment).collect()
    }

    /// `INSERT INTO t(c1, c2) VALUES (t1, t2)` over the tokens, excluding
    /// auto-increment columns.
    pub fn insert_sql(&self, tokens: &[ColumnToken]) -> String {
        let mut cols = String::new();
        let mut vals = String::new();
        for token in tokens {
            let column = match self.column(&token.column) {
                Some(c) => c,
                None => continue,
            };
            if column.auto_increment {
                continue;
            }
            if !cols.is_empty() {
                cols.push_str(", ");
                vals.push_str(", ");
            }
            cols.push_str(&column.name);
            vals.push_str(&token.token);
        }
        format!("INSERT INTO {}({}) VALUES ({})", self.name, cols, vals)
    }

    /// `UPDATE t SET non-keys WHERE keys`.
    pub fn update_sql(&self, non_keys: &[ColumnToken], keys: &[ColumnToken]) -> String {
        let mut sets = String::new();
        for token in non_keys {
            if !sets.is_empty() {
                sets.push_str(", ");
            }
            sets.push_str(&token.column);
            sets.push_str(" = ");
            sets.push_str(&token.token);
        }
        let where_clause = where_columns(keys);
        format!("UPDATE {} SET {}{}", self.name, sets, where_clause)
    }

    /// `DELETE FROM t WHERE keys`.
    pub fn delete_sql(&self, keys: &[ColumnToken]) -> String {
        format!("DELETE FROM {}{}", self.name, where_columns(keys))
    }

    /// `SELECT * FROM t WHERE keys`.
    pub fn select_sql(&self, keys: &[ColumnToken]) -> String {
        format!("SELECT * FROM {}{}", self.name, where_columns(keys))
    }
}

#[cfg(test)]
impl TableMeta {
    pub(crate) fn for_test(name: &str, columns: Vec<ColumnMeta>) -> TableMeta {
        TableMeta {
            name: name.to_string(),
            columns,
        }
    }
}

fn where_columns(tokens: &[ColumnToken]) -> String {
    if tokens.is_empty() {
        return String::new();
    }
    let mut clause = String::from(" WHERE ");
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            clause.push_str(" AND ");
        }
        clause.push_str(&token.column);
        clause.push_str(" = ");
        clause.push_str(&token.token);
    }
    clause
}

fn string_of(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn bool_of(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Some(serde_json::Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
