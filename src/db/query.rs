//! Executes query statements and materializes their results.
//!
//! A `Query` is obtained from a [`DbAccess`] and fed either literal SQL
//! or a fragment id, plus positional or named parameters. Results come
//! back as generic datasets, scalars, several datasets from one
//! execution, or typed objects populated through an ORM mapping. The
//! connection is controlled automatically: each call opens and closes
//! unless an enclosing `perform`/`transact` already holds the context
//! open.

use crate::data::{DataList, DataRow, Dataset, Fetch};
use crate::db::access::{DbAccess, settle};
use crate::db::action::{ActionState, orm_resolved, row_value};
use crate::db::context::DbContext;
use crate::db::parameters::Parameters;
use crate::error::{DbError, DbResult};
use crate::sql::orm::OrmMapping;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

pub struct Query {
    db: DbAccess,
    state: ActionState,
}

impl Query {
    pub(crate) fn new(db: DbAccess) -> Self {
        Self {
            db,
            state: ActionState::default(),
        }
    }

    /// Sets the SQL statement to work with: a SELECT, or text calling a
    /// stored procedure that returns query results.
    pub fn sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.state.set_sql(sql);
        self
    }

    /// Sets the id of a `query` (or `sql`) fragment, in
    /// `namespace.id` form.
    pub fn sql_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.state.set_sql_id(id);
        self
    }

    /// Positional arguments for a statement written with `?` markers.
    pub fn params(&mut self, args: Vec<Value>) -> DbResult<&mut Self> {
        self.state.set_args(args)?;
        Ok(self)
    }

    /// Sets one named value.
    pub fn param(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.state.set_param(name, value);
        self
    }

    /// Sets named values from the key/value pairs.
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

    async fn fetch_rows(&mut self, ctx: &mut DbContext) -> DbResult<Vec<DataRow>> {
        let resolved = self.state.resolve(&self.db, ctx, false).await?;
        let conn = ctx.connection_mut(self.db.key())?;
        conn.fetch(&resolved.statement, &resolved.values).await
    }

    /// Executes the statement and returns the rows in a dataset with the
    /// pagination bookkeeping reset to the actual row count.
    pub async fn dataset(&mut self, ctx: &mut DbContext) -> DbResult<Dataset> {
        let opened = self.db.open(ctx).await?;
        let result = self.fetch_rows(ctx).await.map(Dataset::complete);
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        let dataset = settle(&db, ctx, opened, result).await?;
        debug!(rows = dataset.len(), "rows selected");
        Ok(dataset)
    }

    /// First column of the first row, or null for an empty result.
    pub async fn value(&mut self, ctx: &mut DbContext) -> DbResult<Value> {
        let dataset = self.dataset(ctx).await?;
        Ok(dataset
            .get(0)
            .and_then(|row| row.values().next().cloned())
            .unwrap_or(Value::Null))
    }

    /// Executes once and returns one dataset per result set the statement
    /// produced (stored procedures and multi-statement text may return
    /// several).
    pub async fn datasets(&mut self, ctx: &mut DbContext) -> DbResult<Vec<Dataset>> {
        let opened = self.db.open(ctx).await?;
        let result = async {
            let resolved = self.state.resolve(&self.db, ctx, false).await?;
            let conn = ctx.connection_mut(self.db.key())?;
            let sets = conn.fetch_sets(&resolved.statement, &resolved.values).await?;
            Ok(sets.into_iter().map(Dataset::complete).collect::<Vec<_>>())
        }
        .await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        settle(&db, ctx, opened, result).await
    }

    /// Executes the statement and returns typed objects populated through
    /// the ORM mapping named by the fragment's result alias.
    pub async fn objects<T: DeserializeOwned>(
        &mut self,
        ctx: &mut DbContext,
    ) -> DbResult<DataList<T>> {
        self.objects_with(ctx, |_| None).await
    }

    /// Like [`Query::objects`], invoking `at_last` on the last row to
    /// compute pagination numbers without a second round trip.
    pub async fn objects_with<T: DeserializeOwned>(
        &mut self,
        ctx: &mut DbContext,
        at_last: impl FnOnce(&DataRow) -> Option<Fetch>,
    ) -> DbResult<DataList<T>> {
        let opened = self.db.open(ctx).await?;
        let result = async {
            let resolved = self.state.resolve(&self.db, ctx, false).await?;
            let alias = resolved.result_alias.clone().ok_or_else(|| {
                DbError::mapping("unable to determine the result type", "query")
            })?;
            let orm = self.db.registry().orm(&alias)?;
            let conn = ctx.connection_mut(self.db.key())?;
            let rows = conn.fetch(&resolved.statement, &resolved.values).await?;
            Ok((orm, rows))
        }
        .await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        let (orm, rows) = settle(&db, ctx, opened, result).await?;

        let last_row = rows.last().cloned();
        let mut list = DataList::complete(
            rows.iter()
                .map(|row| materialize::<T>(&orm, row))
                .collect::<DbResult<Vec<T>>>()?,
        );
        debug!(rows = list.len(), "objects selected");
        if !list.is_empty()
            && let Some(last) = last_row
            && let Some(fetch) = at_last(&last)
        {
            fetch.apply(&mut list);
        }
        Ok(list)
    }

    /// Executes the statement and returns at most one typed object;
    /// several rows are an error.
    pub async fn object<T: DeserializeOwned>(
        &mut self,
        ctx: &mut DbContext,
    ) -> DbResult<Option<T>> {
        let list = self.objects::<T>(ctx).await?;
        one_of(list.into_items())
    }

    /// Generates and executes a SELECT with a key-column filter from the
    /// ORM mapping for the type or alias. Key property values are
    /// supplied as named parameters.
    pub async fn find<T: DeserializeOwned>(
        &mut self,
        ctx: &mut DbContext,
        type_or_alias: &str,
    ) -> DbResult<Option<T>> {
        let opened = self.db.open(ctx).await?;
        let result = async {
            let (orm, derived) = orm_resolved(&self.db, ctx, type_or_alias).await?;
            // Setting the statement resets the executor; keep the key
            // parameters supplied so far.
            let named = self.state.named().clone();
            self.state.set_sql(derived.select);
            self.state.set_params(named);
            let resolved = self.state.resolve(&self.db, ctx, false).await?;
            let conn = ctx.connection_mut(self.db.key())?;
            let rows = conn.fetch(&resolved.statement, &resolved.values).await?;
            let objects = rows
                .iter()
                .map(|row| materialize::<T>(&orm, row))
                .collect::<DbResult<Vec<T>>>()?;
            one_of(objects)
        }
        .await;
        if result.is_err() {
            self.state.reset();
        }
        let db = self.db.clone();
        settle(&db, ctx, opened, result).await
    }

    /// Maps an already-fetched dataset to typed objects through the ORM
    /// mapping; no database round trip.
    pub fn objects_from<T: DeserializeOwned>(
        &self,
        dataset: &Dataset,
        type_or_alias: &str,
    ) -> DbResult<Vec<T>> {
        let orm = self.db.registry().orm(type_or_alias)?;
        dataset
            .iter()
            .map(|row| materialize::<T>(&orm, row))
            .collect()
    }
}

fn one_of<T>(mut items: Vec<T>) -> DbResult<Option<T>> {
    match items.len() {
        0 => Ok(None),
        1 => Ok(items.pop()),
        n => Err(DbError::Database {
            message: format!("{n} rows returned where at most one was expected"),
            sql_state: None,
            source: None,
        }),
    }
}

/// Builds the object for one row from the property↔column pairs and
/// deserializes it.
fn materialize<T: DeserializeOwned>(orm: &OrmMapping, row: &DataRow) -> DbResult<T> {
    let mut object = Map::new();
    for mapping in orm.mappings() {
        object.insert(mapping.property.clone(), row_value(row, &mapping.column));
    }
    serde_json::from_value(Value::Object(object)).map_err(|e| {
        DbError::mapping(
            format!("result row does not fit the declared type: {e}"),
            orm.type_name().to_string(),
        )
    })
}
