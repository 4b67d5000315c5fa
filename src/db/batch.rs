//! Executes one statement over many parameter rows.
//!
//! Rows accumulate either as positional argument arrays or as named-value
//! maps; named rows are merged with any values shared across the whole
//! batch. Every row must build the same statement text; the one prepared
//! statement then runs once per row inside a single transaction, and the
//! per-row affected counts come back in order.

use crate::db::access::{DbAccess, open_tx, settle_tx};
use crate::db::action::{ActionState, Source, entry_values};
use crate::db::context::DbContext;
use crate::error::{DbError, DbResult};
use crate::sql::builder::SqlBuilder;
use serde_json::{Map, Value};
use tracing::debug;

pub struct Batch {
    db: DbAccess,
    state: ActionState,
    positional_rows: Vec<Vec<Value>>,
    named_rows: Vec<Map<String, Value>>,
}

impl Batch {
    pub(crate) fn new(db: DbAccess) -> Self {
        Self {
            db,
            state: ActionState::default(),
            positional_rows: Vec::new(),
            named_rows: Vec::new(),
        }
    }

    /// Sets the statement text. A change clears accumulated rows.
    pub fn sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.state.set_sql(sql);
        self.positional_rows.clear();
        self.named_rows.clear();
        self
    }

    /// Sets the fragment id (`namespace.id`). A change clears accumulated
    /// rows.
    pub fn sql_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.state.set_sql_id(id);
        self.positional_rows.clear();
        self.named_rows.clear();
        self
    }

    /// Sets a named value shared by every row of the batch.
    pub fn param(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.state.set_param(name, value);
        self
    }

    /// Adds one row of positional arguments.
    pub fn add_params(&mut self, args: Vec<Value>) -> &mut Self {
        self.positional_rows.push(args);
        self
    }

    /// Adds one row of named values.
    pub fn add_params_map(&mut self, params: Map<String, Value>) -> &mut Self {
        self.named_rows.push(params);
        self
    }

    pub fn row_count(&self) -> usize {
        self.positional_rows.len() + self.named_rows.len()
    }

    /// Clears the executor to its initial state.
    pub fn close(&mut self) -> &mut Self {
        self.positional_rows.clear();
        self.named_rows.clear();
        self.state.reset();
        self
    }

    /// Executes the batch in one transaction and returns the affected-row
    /// count of every row, in accumulation order.
    pub async fn execute(&mut self, ctx: &mut DbContext) -> DbResult<Vec<u64>> {
        let (opened, began) = open_tx(&self.db, ctx).await?;
        let result = self.do_execute(ctx).await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        let counts = settle_tx(&db, ctx, opened, began, result).await?;
        debug!(rows = counts.len(), "batch executed");
        Ok(counts)
    }

    async fn do_execute(&mut self, ctx: &mut DbContext) -> DbResult<Vec<u64>> {
        let source = self
            .state
            .source()
            .cloned()
            .ok_or_else(|| DbError::state("no sql or sql id set"))?;
        let shared = self.state.named().clone();

        // Plain positional batches bypass the builder entirely.
        if let Source::Text(sql) = &source
            && shared.is_empty()
            && self.named_rows.is_empty()
        {
            if sql.to_uppercase().contains("OUT:") {
                return Err(DbError::state(
                    "OUT parameters are not supported by this executor",
                ));
            }
            let mut counts = Vec::with_capacity(self.positional_rows.len());
            let conn = ctx.connection_mut(self.db.key())?;
            for row in &self.positional_rows {
                counts.push(conn.execute(sql, row).await?.rows_affected);
            }
            return Ok(counts);
        }

        if !self.positional_rows.is_empty() {
            return Err(DbError::state(
                "positional rows cannot be combined with named rows or shared values",
            ));
        }

        // Shared values override row values, so a batch-wide constant
        // cannot be shadowed per row.
        let rows: Vec<Map<String, Value>> = self
            .named_rows
            .iter()
            .map(|row| {
                let mut merged = row.clone();
                merged.extend(shared.clone());
                merged
            })
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let registry = self.db.registry().clone();
        let builder = SqlBuilder::new(&registry);
        let mut artifact = match &source {
            Source::Text(sql) => builder.build_text_rows(sql, rows)?,
            Source::Fragment(id) => builder.build_fragment_rows(id, rows)?,
        };
        let statement = artifact.statement().to_string();

        let mut counts = Vec::with_capacity(artifact.row_entries().len());
        let conn = ctx.connection_mut(self.db.key())?;
        for entries in artifact.row_entries() {
            let values = entry_values(entries.clone())?;
            counts.push(conn.execute(&statement, &values).await?.rows_affected);
        }
        Ok(counts)
    }
}
