//! Executes update statements and persists mapped objects.
//!
//! An `Update` runs INSERT/UPDATE/DELETE text or fragments and returns
//! affected-row counts, retrieves generated keys from INSERTs, and
//! persists objects through their ORM mapping: before-steps first, then
//! the generated statement, then — for inserts into tables with
//! auto-increment columns — the generated key written back into the
//! object. Connection and transaction are controlled automatically; when
//! no enclosing `transact` is running, each call is its own transaction.

use crate::data::DataRow;
use crate::db::access::{DbAccess, open_tx, settle_tx};
use crate::db::action::{ActionState, entry_values, object_beans, orm_resolved, row_value, run_steps};
use crate::db::connection::Backend;
use crate::db::context::DbContext;
use crate::db::parameters::Parameters;
use crate::error::{DbError, DbResult};
use crate::eval::Evaluator;
use crate::sql::builder::SqlBuilder;
use crate::sql::orm::OBJ_REF;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

enum Persist {
    Create,
    Update,
    Delete,
}

pub struct Update {
    db: DbAccess,
    state: ActionState,
}

impl Update {
    pub(crate) fn new(db: DbAccess) -> Self {
        Self {
            db,
            state: ActionState::default(),
        }
    }

    /// Sets the statement to work with: INSERT/UPDATE/DELETE text or text
    /// calling a stored procedure.
    pub fn sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.state.set_sql(sql);
        self
    }

    /// Sets the id of an `update` fragment, in `namespace.id` form.
    pub fn sql_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.state.set_sql_id(id);
        self
    }

    /// Positional arguments for a statement written with `?` markers.
    pub fn params(&mut self, args: Vec<Value>) -> DbResult<&mut Self> {
        self.state.set_args(args)?;
        Ok(self)
    }

    pub fn param(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.state.set_param(name, value);
        self
    }

    pub fn params_map(&mut self, params: Map<String, Value>) -> &mut Self {
        self.state.set_params(params);
        self
    }

    pub fn parameters(&self) -> &Parameters {
        self.state.parameters()
    }

    /// Clears the executor to its initial state.
    pub fn close(&mut self) -> &mut Self {
        self.state.reset();
        self
    }

    /// Executes the statement (running any fragment before-steps first)
    /// and returns the number of affected rows.
    pub async fn execute(&mut self, ctx: &mut DbContext) -> DbResult<u64> {
        let (opened, began) = open_tx(&self.db, ctx).await?;
        let result = async {
            let resolved = self.state.resolve(&self.db, ctx, true).await?;
            let conn = ctx.connection_mut(self.db.key())?;
            let outcome = conn.execute(&resolved.statement, &resolved.values).await?;
            Ok(outcome.rows_affected)
        }
        .await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        let affected = settle_tx(&db, ctx, opened, began, result).await?;
        debug!(affected, "rows affected");
        Ok(affected)
    }

    /// Executes an INSERT and returns its generated keys. On PostgreSQL
    /// the statement must carry a `RETURNING` clause; elsewhere the
    /// driver-reported last insert id comes back under
    /// `last_insert_id`.
    pub async fn auto_inc_keys(&mut self, ctx: &mut DbContext) -> DbResult<DataRow> {
        let (opened, began) = open_tx(&self.db, ctx).await?;
        let result = async {
            let resolved = self.state.resolve(&self.db, ctx, true).await?;
            exec_keys(&self.db, ctx, &resolved.statement, &resolved.values, &[]).await
        }
        .await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        settle_tx(&db, ctx, opened, began, result).await
    }

    /// First generated key of [`Update::auto_inc_keys`] as an integer.
    pub async fn auto_inc(&mut self, ctx: &mut DbContext) -> DbResult<i64> {
        let keys = self.auto_inc_keys(ctx).await?;
        keys.values()
            .next()
            .and_then(Value::as_i64)
            .ok_or_else(|| DbError::internal("no generated key returned"))
    }

    /// INSERTs the objects through the ORM mapping for the type or alias.
    /// Generated auto-increment values are written back into the objects.
    pub async fn create(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [Value],
    ) -> DbResult<u64> {
        self.save(ctx, type_or_alias, objects, Persist::Create).await
    }

    /// UPDATEs the objects through the ORM mapping for the type or alias.
    pub async fn update(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [Value],
    ) -> DbResult<u64> {
        self.save(ctx, type_or_alias, objects, Persist::Update).await
    }

    /// DELETEs the objects through the ORM mapping for the type or alias.
    pub async fn delete(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [Value],
    ) -> DbResult<u64> {
        self.save(ctx, type_or_alias, objects, Persist::Delete).await
    }

    /// Typed counterpart of [`Update::create`]: generated keys and
    /// before-step effects are written back into the values.
    pub async fn create_objects<T>(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [T],
    ) -> DbResult<u64>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut values = to_values(objects)?;
        let affected = self.create(ctx, type_or_alias, &mut values).await?;
        for (slot, value) in objects.iter_mut().zip(values) {
            *slot = serde_json::from_value(value).map_err(|e| {
                DbError::mapping(format!("object does not fit its type: {e}"), type_or_alias)
            })?;
        }
        Ok(affected)
    }

    async fn save(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [Value],
        persist: Persist,
    ) -> DbResult<u64> {
        let (opened, began) = open_tx(&self.db, ctx).await?;
        let result = self.do_save(ctx, type_or_alias, objects, persist).await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        let affected = settle_tx(&db, ctx, opened, began, result).await?;
        debug!(affected, "rows affected");
        Ok(affected)
    }

    async fn do_save(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
        objects: &mut [Value],
        persist: Persist,
    ) -> DbResult<u64> {
        let registry = self.db.registry().clone();
        let mut affected = 0;
        for object in objects.iter_mut() {
            if object.is_null() {
                continue;
            }
            let (orm, derived) = orm_resolved(&self.db, ctx, type_or_alias).await?;
            let (steps, statement_sql) = match persist {
                Persist::Create => (orm.before_insert(), derived.insert.as_str()),
                Persist::Update => (orm.before_update(), derived.update.as_str()),
                Persist::Delete => (orm.before_delete(), derived.delete.as_str()),
            };

            let mut beans = object_beans(object);
            affected += run_steps(&self.db, ctx, steps, &mut beans).await?;

            let mut artifact = SqlBuilder::new(&registry).build_text(statement_sql, &mut beans)?;
            let statement = artifact.statement().to_string();
            let values = entry_values(artifact.take_entries())?;

            let with_keys =
                matches!(persist, Persist::Create) && !derived.auto_increment.is_empty();
            if with_keys {
                let columns: Vec<String> = derived
                    .auto_increment
                    .iter()
                    .map(|m| m.column.clone())
                    .collect();
                let keys = exec_keys(&self.db, ctx, &statement, &values, &columns).await?;
                let fallback: Vec<Value> = keys.values().cloned().collect();
                for (i, mapping) in derived.auto_increment.iter().enumerate() {
                    let mut value = row_value(&keys, &mapping.column);
                    if value.is_null() {
                        value = fallback.get(i).cloned().unwrap_or(Value::Null);
                    }
                    beans.set_value(&format!("{}.{}", OBJ_REF, mapping.property), value);
                }
                affected += 1;
            } else {
                let conn = ctx.connection_mut(self.db.key())?;
                affected += conn.execute(&statement, &values).await?.rows_affected;
            }

            // Before-steps and generated keys may have changed the
            // object's properties.
            *object = beans.value(OBJ_REF);
        }
        Ok(affected)
    }
}

/// Runs the statement and returns its generated keys.
async fn exec_keys(
    db: &DbAccess,
    ctx: &mut DbContext,
    statement: &str,
    values: &[Value],
    auto_columns: &[String],
) -> DbResult<DataRow> {
    let conn = ctx.connection_mut(db.key())?;
    match conn.backend() {
        Backend::Postgres => {
            let statement = if statement.to_uppercase().contains("RETURNING") {
                statement.to_string()
            } else if !auto_columns.is_empty() {
                format!("{statement} RETURNING {}", auto_columns.join(", "))
            } else {
                return Err(DbError::state(
                    "generated keys on PostgreSQL require a RETURNING clause",
                ));
            };
            let rows = conn.fetch(&statement, values).await?;
            Ok(rows.into_iter().next().unwrap_or_default())
        }
        Backend::MySql | Backend::Sqlite => {
            let outcome = conn.execute(statement, values).await?;
            let id = outcome
                .last_insert_id
                .ok_or_else(|| DbError::internal("driver reported no generated key"))?;
            let mut keys = DataRow::new();
            let name = auto_columns
                .first()
                .map(String::as_str)
                .unwrap_or("last_insert_id");
            keys.insert(name.to_string(), json!(id));
            Ok(keys)
        }
    }
}

fn to_values<T: Serialize>(objects: &[T]) -> DbResult<Vec<Value>> {
    objects
        .iter()
        .map(|o| {
            serde_json::to_value(o)
                .map_err(|e| DbError::internal(format!("object not serializable: {e}")))
        })
        .collect()
}
