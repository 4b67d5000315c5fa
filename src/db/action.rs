//! Plumbing shared by the action executors.
//!
//! Holds the statement source, the caller-supplied arguments, and the
//! binder state, and resolves them into an executable statement: raw text
//! with positional binding, or a built artifact when named values or a
//! fragment id are in play. Update-fragment and ORM before-steps run here
//! as ordinary statements through the same execution path.

use crate::data::DataRow;
use crate::db::access::DbAccess;
use crate::db::context::DbContext;
use crate::db::parameters::Parameters;
use crate::error::{DbError, DbResult};
use crate::eval::{BeanContext, Evaluator};
use crate::sql::builder::SqlBuilder;
use crate::sql::orm::OBJ_REF;
use crate::sql::sheet::BeforeStep;
use serde_json::{Map, Value};

/// Where the statement text comes from.
#[derive(Debug, Clone)]
pub(crate) enum Source {
    Text(String),
    Fragment(String),
}

/// A statement ready for the driver.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub statement: String,
    pub values: Vec<Value>,
    pub result_alias: Option<String>,
}

/// Common executor state: statement source plus parameters.
#[derive(Debug, Default)]
pub(crate) struct ActionState {
    source: Option<Source>,
    named: Map<String, Value>,
    params: Parameters,
}

impl ActionState {
    /// Sets literal statement text. A change resets the executor state.
    pub fn set_sql(&mut self, sql: impl Into<String>) {
        let sql = sql.into();
        if !matches!(&self.source, Some(Source::Text(existing)) if *existing == sql) {
            self.reset();
            self.source = Some(Source::Text(sql));
        }
    }

    /// Sets a fragment id (`namespace.id`). A change resets the executor
    /// state.
    pub fn set_sql_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !matches!(&self.source, Some(Source::Fragment(existing)) if *existing == id) {
            self.reset();
            self.source = Some(Source::Fragment(id));
        }
    }

    pub fn set_args(&mut self, args: Vec<Value>) -> DbResult<()> {
        if !self.named.is_empty() {
            return Err(DbError::state(
                "positional arguments and named parameters cannot be used together",
            ));
        }
        self.params.set_args(args)
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: Value) {
        self.named.insert(name.into(), value);
    }

    pub fn set_params(&mut self, params: Map<String, Value>) {
        self.named.extend(params);
    }

    pub fn named(&self) -> &Map<String, Value> {
        &self.named
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Clears statement, parameters, and named values.
    pub fn reset(&mut self) {
        self.source = None;
        self.named.clear();
        self.params.clear();
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Resolves the executable statement. `run_before` executes any
    /// before-steps declared on the referenced fragment first.
    pub async fn resolve(
        &mut self,
        db: &DbAccess,
        ctx: &mut DbContext,
        run_before: bool,
    ) -> DbResult<Resolved> {
        let registry = db.registry().clone();
        match self.source.clone() {
            None => Err(DbError::state("no sql or sql id set")),
            Some(Source::Text(sql)) => {
                if self.named.is_empty() {
                    let values = self.params.bind_values()?;
                    reject_out_tokens(&sql)?;
                    Ok(Resolved {
                        statement: sql,
                        values,
                        result_alias: None,
                    })
                } else {
                    let mut beans = BeanContext::from_map(self.named.clone());
                    let mut artifact =
                        SqlBuilder::new(&registry).build_text(&sql, &mut beans)?;
                    let statement = artifact.statement().to_string();
                    self.params.set_entries(artifact.take_entries())?;
                    Ok(Resolved {
                        statement,
                        values: self.params.bind_values()?,
                        result_alias: None,
                    })
                }
            }
            Some(Source::Fragment(id)) => {
                let fragment = registry.fragment(&id)?;
                let mut beans = BeanContext::from_map(self.named.clone());
                if run_before && !fragment.before.is_empty() {
                    run_steps(db, ctx, &fragment.before, &mut beans).await?;
                }
                let mut artifact =
                    SqlBuilder::new(&registry).build_fragment(&id, &mut beans)?;
                let statement = artifact.statement().to_string();
                let result_alias = artifact.result_alias().map(str::to_string);
                self.params.set_entries(artifact.take_entries())?;
                Ok(Resolved {
                    statement,
                    values: self.params.bind_values()?,
                    result_alias,
                })
            }
        }
    }
}

/// Raw statement text must not smuggle OUT markers past the builder.
fn reject_out_tokens(sql: &str) -> DbResult<()> {
    if sql.to_uppercase().contains("OUT:") {
        return Err(DbError::state(
            "OUT parameters are not supported by this executor",
        ));
    }
    Ok(())
}

/// Column value from a row, matching the name case-insensitively the way
/// catalogs report identifiers.
pub(crate) fn row_value(row: &DataRow, column: &str) -> Value {
    if let Some(v) = row.get(column) {
        return v.clone();
    }
    row.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(column))
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null)
}

/// Runs before-persist steps against the beans: copies source properties,
/// copies queried source columns, or executes plain update bodies.
/// Returns the affected-row total of any update bodies.
pub(crate) async fn run_steps(
    db: &DbAccess,
    ctx: &mut DbContext,
    steps: &[BeforeStep],
    beans: &mut BeanContext,
) -> DbResult<u64> {
    let registry = db.registry().clone();
    let mut affected = 0;
    for step in steps {
        if step.targets.is_empty() {
            let mut artifact = SqlBuilder::new(&registry).build_instructions(&step.body, beans)?;
            let statement = artifact.statement().to_string();
            if statement.is_empty() {
                continue;
            }
            let values = entry_values(artifact.take_entries())?;
            let conn = ctx.connection_mut(db.key())?;
            affected += conn.execute(&statement, &values).await?.rows_affected;
            continue;
        }

        if !step.source_properties.is_empty() {
            let sources: Vec<Value> = step
                .source_properties
                .iter()
                .map(|p| beans.value(p))
                .collect();
            for (target, value) in step.targets.iter().zip(sources) {
                beans.set_value(target, value);
            }
        }
        if !step.source_columns.is_empty() {
            let mut artifact = SqlBuilder::new(&registry).build_instructions(&step.body, beans)?;
            let statement = artifact.statement().to_string();
            let values = entry_values(artifact.take_entries())?;
            let conn = ctx.connection_mut(db.key())?;
            let rows = conn.fetch(&statement, &values).await?;
            let row = rows.first().ok_or_else(|| DbError::Database {
                message: "before-step query returned no rows".to_string(),
                sql_state: None,
                source: None,
            })?;
            for (target, column) in step.targets.iter().zip(&step.source_columns) {
                beans.set_value(target, row_value(row, column));
            }
        }
    }
    Ok(affected)
}

/// Looks up the ORM mapping and makes sure its derived statements exist,
/// introspecting the table on first use. Opens the connection when this
/// call has to.
pub(crate) async fn orm_resolved(
    db: &DbAccess,
    ctx: &mut DbContext,
    type_or_alias: &str,
) -> DbResult<(
    std::sync::Arc<crate::sql::orm::OrmMapping>,
    crate::sql::orm::DerivedSql,
)> {
    let registry = db.registry().clone();
    let orm = registry.orm(type_or_alias)?;
    if let Some(derived) = orm.derived() {
        return Ok((orm, derived));
    }

    let table_name = orm
        .table()
        .ok_or_else(|| {
            DbError::mapping("no table declared for orm mapping", type_or_alias)
        })?
        .to_string();

    let opened = db.open(ctx).await?;
    let result = async {
        let catalog = db.catalog();
        let schema = db.schema();
        let conn = ctx.connection_mut(db.key())?;
        let table = registry
            .table(&table_name, conn, catalog.as_deref(), schema.as_deref())
            .await?;
        orm.resolve(&table)
    }
    .await;
    if opened {
        db.close(ctx).await;
    }
    result.map(|derived| (orm, derived))
}

pub(crate) fn entry_values(
    entries: Vec<crate::sql::artifact::ParamEntry>,
) -> DbResult<Vec<Value>> {
    let mut params = Parameters::new();
    params.set_entries(entries)?;
    params.bind_values()
}

/// The object reference every generated ORM statement resolves its
/// properties against.
pub(crate) fn object_beans(object: &Value) -> BeanContext {
    let mut beans = BeanContext::new();
    beans.set_bean(OBJ_REF, object.clone());
    beans
}
