//! The driver boundary: one checked-out connection per logical execution
//! context, wrapped in an enum over the supported backends.
//!
//! The pool is only a connection supplier. Everything the toolkit runs for
//! one execution context goes through the single [`DbConnection`] checked
//! out for it, so statements and the transaction observe one session.

use crate::data::DataRow;
use crate::db::row;
use crate::error::{DbError, DbResult};
use futures_util::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Either, MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool};
use tracing::debug;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    MySql,
    Sqlite,
}

/// A connection pool for one configured datasource.
#[derive(Clone)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Connects a pool for the URL, picking the backend from the scheme.
    pub async fn connect(url: &str) -> DbResult<DbPool> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(DbPool::Postgres(PgPool::connect(url).await?)),
            "mysql" | "mariadb" => Ok(DbPool::MySql(MySqlPool::connect(url).await?)),
            "sqlite" => Ok(DbPool::Sqlite(SqlitePool::connect(url).await?)),
            other => Err(DbError::configuration(format!(
                "unsupported connection scheme '{other}' in '{url}'"
            ))),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            DbPool::Postgres(_) => Backend::Postgres,
            DbPool::MySql(_) => Backend::MySql,
            DbPool::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Checks out one connection for a logical execution context.
    pub async fn acquire(&self) -> DbResult<DbConnection> {
        Ok(match self {
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.acquire().await?),
            DbPool::MySql(pool) => DbConnection::MySql(pool.acquire().await?),
            DbPool::Sqlite(pool) => DbConnection::Sqlite(pool.acquire().await?),
        })
    }
}

/// Result of a non-query statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Key generated by the statement, where the backend reports one
    /// (MySQL, SQLite).
    pub last_insert_id: Option<i64>,
}

/// One live database session.
pub enum DbConnection {
    Postgres(PoolConnection<Postgres>),
    MySql(PoolConnection<MySql>),
    Sqlite(PoolConnection<Sqlite>),
}

impl DbConnection {
    pub fn backend(&self) -> Backend {
        match self {
            DbConnection::Postgres(_) => Backend::Postgres,
            DbConnection::MySql(_) => Backend::MySql,
            DbConnection::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Executes a non-query statement with positional parameters.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<ExecOutcome> {
        let outcome = match self {
            DbConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_pg(query, param);
                }
                let result = query.execute(&mut **conn).await?;
                ExecOutcome {
                    rows_affected: result.rows_affected(),
                    last_insert_id: None,
                }
            }
            DbConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let result = query.execute(&mut **conn).await?;
                ExecOutcome {
                    rows_affected: result.rows_affected(),
                    last_insert_id: Some(result.last_insert_id() as i64),
                }
            }
            DbConnection::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(&mut **conn).await?;
                ExecOutcome {
                    rows_affected: result.rows_affected(),
                    last_insert_id: Some(result.last_insert_rowid()),
                }
            }
        };
        debug!(sql, rows_affected = outcome.rows_affected, "statement executed");
        Ok(outcome)
    }

    /// Executes a query and materializes every row.
    pub async fn fetch(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<DataRow>> {
        let rows = match self {
            DbConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_pg(query, param);
                }
                let rows: Vec<sqlx::postgres::PgRow> =
                    query.fetch(&mut **conn).try_collect().await?;
                rows.iter().map(row::record_of_pg).collect()
            }
            DbConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let rows: Vec<sqlx::mysql::MySqlRow> =
                    query.fetch(&mut **conn).try_collect().await?;
                rows.iter().map(row::record_of_mysql).collect()
            }
            DbConnection::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows: Vec<sqlx::sqlite::SqliteRow> =
                    query.fetch(&mut **conn).try_collect().await?;
                rows.iter().map(row::record_of_sqlite).collect()
            }
        };
        debug!(sql, row_count = rows.len(), "rows fetched");
        Ok(rows)
    }

    /// Executes once and collects every returned result set, in order.
    ///
    /// Result-set boundaries come from the driver's row stream; trailing
    /// boundaries that produced no rows (e.g. update counts of a script)
    /// are trimmed down to at least one set.
    pub async fn fetch_sets(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> DbResult<Vec<Vec<DataRow>>> {
        let mut sets: Vec<Vec<DataRow>> = Vec::new();
        match self {
            DbConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_pg(query, param);
                }
                let mut current = Vec::new();
                let mut stream = query.fetch_many(&mut **conn);
                while let Some(item) = stream.try_next().await? {
                    match item {
                        Either::Left(_) => sets.push(std::mem::take(&mut current)),
                        Either::Right(row) => current.push(row::record_of_pg(&row)),
                    }
                }
                if !current.is_empty() {
                    sets.push(current);
                }
            }
            DbConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let mut current = Vec::new();
                let mut stream = query.fetch_many(&mut **conn);
                while let Some(item) = stream.try_next().await? {
                    match item {
                        Either::Left(_) => sets.push(std::mem::take(&mut current)),
                        Either::Right(row) => current.push(row::record_of_mysql(&row)),
                    }
                }
                if !current.is_empty() {
                    sets.push(current);
                }
            }
            DbConnection::Sqlite(conn) => {
                let mut current = Vec::new();
                if params.is_empty() {
                    // Unparameterized text may hold several statements.
                    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut **conn);
                    while let Some(item) = stream.try_next().await? {
                        match item {
                            Either::Left(_) => sets.push(std::mem::take(&mut current)),
                            Either::Right(row) => current.push(row::record_of_sqlite(&row)),
                        }
                    }
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = bind_sqlite(query, param);
                    }
                    let mut stream = query.fetch_many(&mut **conn);
                    while let Some(item) = stream.try_next().await? {
                        match item {
                            Either::Left(_) => sets.push(std::mem::take(&mut current)),
                            Either::Right(row) => current.push(row::record_of_sqlite(&row)),
                        }
                    }
                }
                if !current.is_empty() {
                    sets.push(current);
                }
            }
        }
        while sets.len() > 1 && sets.last().is_some_and(Vec::is_empty) {
            sets.pop();
        }
        debug!(sql, set_count = sets.len(), "result sets fetched");
        Ok(sets)
    }

    pub(crate) async fn begin(&mut self) -> DbResult<()> {
        let sql = match self.backend() {
            Backend::MySql => "START TRANSACTION",
            _ => "BEGIN",
        };
        self.execute(sql, &[]).await.map(|_| ())
    }

    pub(crate) async fn commit(&mut self) -> DbResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    pub(crate) async fn rollback(&mut self) -> DbResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }
}

fn bind_pg<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => query.bind(v.as_str()),
        other => query.bind(Json(other)),
    }
}

fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => query.bind(v.as_str()),
        other => query.bind(Json(other)),
    }
}

fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => query.bind(v.as_str()),
        // SQLite has no native JSON type; store the serialized form.
        other => query.bind(other.to_string()),
    }
}
