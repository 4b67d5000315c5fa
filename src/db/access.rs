//! The top-level facade over one configured datasource.
//!
//! A [`DbAccess`] derives a stable identity key from its configuration, so
//! every instance built from equal configuration shares the one
//! connection and transaction held in the [`DbContext`] it is called
//! with. `perform` and `transact` are the composition primitives:
//! independently written functions call them freely, and arbitrarily
//! nested calls flatten into one physical open/close and one
//! begin/commit/rollback at the outermost call.
//!
//! ```no_run
//! # use sqlsheet::{DbAccess, DbContext, DbResult, Registry};
//! # async fn demo(registry: std::sync::Arc<Registry>) -> DbResult<()> {
//! let db = DbAccess::new(registry, "main")?;
//! let mut ctx = DbContext::new();
//! let total: i64 = db
//!     .transact(&mut ctx, |db, ctx| {
//!         Box::pin(async move {
//!             let mut update = db.update();
//!             update.sql("UPDATE ACCOUNT SET ACTIVE = 1");
//!             let affected = update.execute(ctx).await?;
//!             Ok(affected as i64)
//!         })
//!     })
//!     .await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

use crate::db::batch::Batch;
use crate::db::context::DbContext;
use crate::db::query::Query;
use crate::db::transaction::Strategy;
use crate::db::update::Update;
use crate::error::{DbError, DbResult};
use crate::registry::Registry;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

/// A task run under `perform`/`transact`.
pub type Task<'c, T> = BoxFuture<'c, DbResult<T>>;

#[derive(Clone)]
pub struct DbAccess {
    registry: Arc<Registry>,
    name: String,
    key: String,
}

impl DbAccess {
    /// Builds a facade for the named connection entry. Equal registry and
    /// name yield an equal identity key.
    pub fn new(registry: Arc<Registry>, connection_name: &str) -> DbResult<DbAccess> {
        registry.connection_entry(connection_name)?;
        let key = format!("{}#{}", registry.config_id(), connection_name);
        Ok(DbAccess {
            registry,
            name: connection_name.to_string(),
            key,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// The identity key connection sharing is scoped by.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    pub fn update(&self) -> Update {
        Update::new(self.clone())
    }

    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    pub fn is_open(&self, ctx: &DbContext) -> bool {
        ctx.is_open(&self.key)
    }

    pub(crate) fn strategy(&self) -> DbResult<Strategy> {
        let entry = self.registry.connection_entry(&self.name)?;
        if let Some(name) = &entry.transaction_manager {
            return Ok(Strategy::Manager(self.registry.coordinator(name)?));
        }
        if let Some(name) = &entry.user_transaction {
            return Ok(Strategy::User(self.registry.coordinator(name)?));
        }
        Ok(Strategy::Local)
    }

    pub(crate) fn catalog(&self) -> Option<String> {
        self.registry
            .connection_entry(&self.name)
            .ok()
            .and_then(|e| e.catalog.clone())
    }

    pub(crate) fn schema(&self) -> Option<String> {
        self.registry
            .connection_entry(&self.name)
            .ok()
            .and_then(|e| e.schema.clone())
    }

    /// Opens the connection for this context. Returns whether *this* call
    /// performed the open; callers use the answer to decide whether they
    /// are responsible for closing.
    pub async fn open(&self, ctx: &mut DbContext) -> DbResult<bool> {
        if ctx.is_open(&self.key) {
            return Ok(false);
        }
        let pool = self.registry.pool(&self.name).await?;
        let conn = pool.acquire().await?;
        ctx.insert_connection(self.key.clone(), conn);
        debug!(ctx = %ctx.id(), key = %self.key, "connection opened");
        Ok(true)
    }

    /// Releases everything held for this facade's key. No-ops when not
    /// open.
    pub async fn close(&self, ctx: &mut DbContext) {
        if !ctx.is_open(&self.key) {
            return;
        }
        ctx.release(&self.key).await;
        debug!(ctx = %ctx.id(), key = %self.key, "connection closed");
    }

    /// Runs the task with the connection open, closing it afterwards if
    /// this call opened it. Failures propagate to the caller.
    pub async fn perform<T, F>(&self, ctx: &mut DbContext, task: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
    {
        self.perform_inner(ctx, task, None::<fn(&DbError) -> T>)
            .await
    }

    /// Like [`DbAccess::perform`], with an exception handler. A failure is
    /// passed to the handler once, converted to the substitute value the
    /// handler returns, and recorded as handled for this context:
    /// sibling and outer wrappers then short-circuit with
    /// [`DbError::Halted`] and no other handler sees the failure.
    pub async fn perform_or<T, F, H>(
        &self,
        ctx: &mut DbContext,
        task: F,
        on_exception: H,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
        H: FnOnce(&DbError) -> T,
    {
        self.perform_inner(ctx, task, Some(on_exception)).await
    }

    async fn perform_inner<T, F, H>(
        &self,
        ctx: &mut DbContext,
        task: F,
        handler: Option<H>,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
        H: FnOnce(&DbError) -> T,
    {
        if ctx.has_handled_failure() {
            return Err(DbError::Halted);
        }
        let opened = self.open(ctx).await?;
        let result = task(self, ctx).await;
        let out = self.handle(ctx, result, handler);
        if opened {
            self.close(ctx).await;
        }
        out
    }

    /// Runs the task in a transaction context. Opens and begins if
    /// needed; only when this call began the transaction does it commit
    /// on success or roll back on failure, so nested calls flatten into
    /// one physical transaction with exactly one rollback.
    pub async fn transact<T, F>(&self, ctx: &mut DbContext, task: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
    {
        self.transact_inner(ctx, task, None::<fn(&DbError) -> T>)
            .await
    }

    /// Like [`DbAccess::transact`], with an exception handler; see
    /// [`DbAccess::perform_or`] for handler semantics. The transaction is
    /// rolled back on any failure regardless of whether the handler
    /// converted it.
    pub async fn transact_or<T, F, H>(
        &self,
        ctx: &mut DbContext,
        task: F,
        on_exception: H,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
        H: FnOnce(&DbError) -> T,
    {
        self.transact_inner(ctx, task, Some(on_exception)).await
    }

    async fn transact_inner<T, F, H>(
        &self,
        ctx: &mut DbContext,
        task: F,
        handler: Option<H>,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c DbAccess, &'c mut DbContext) -> Task<'c, T>,
        H: FnOnce(&DbError) -> T,
    {
        if ctx.has_handled_failure() {
            return Err(DbError::Halted);
        }
        let opened = self.open(ctx).await?;
        let began = match ctx.tx_begin(&self.key, self.strategy()?).await {
            Ok(began) => began,
            Err(error) => {
                if opened {
                    self.close(ctx).await;
                }
                return Err(error);
            }
        };

        let result = task(self, ctx).await;
        let out = match result {
            Ok(value) => {
                let committed = if began {
                    ctx.tx_commit(&self.key).await
                } else {
                    Ok(())
                };
                committed.map(|()| value)
            }
            Err(error) => {
                let out = self.handle(ctx, Err(error), handler);
                if began && let Err(rollback_error) = ctx.tx_rollback(&self.key).await {
                    warn!(%rollback_error, "rollback failed");
                }
                out
            }
        };
        if opened {
            self.close(ctx).await;
        }
        out
    }

    /// Routes a task failure through the handler policy: handled failures
    /// become the substitute value and poison the context; `Halted` and
    /// unhandled failures propagate.
    fn handle<T, H>(
        &self,
        ctx: &mut DbContext,
        result: DbResult<T>,
        handler: Option<H>,
    ) -> DbResult<T>
    where
        H: FnOnce(&DbError) -> T,
    {
        match result {
            Ok(value) => Ok(value),
            Err(error) if error.is_halted() => Err(error),
            Err(error) => match handler {
                Some(handler) => {
                    warn!(%error, ctx = %ctx.id(), "failure handled");
                    let substitute = handler(&error);
                    ctx.note_handled();
                    Ok(substitute)
                }
                None => Err(error),
            },
        }
    }
}

impl std::fmt::Debug for DbAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbAccess").field("key", &self.key).finish()
    }
}

/// Shared head of the update-flavored executors: open the connection and
/// begin the transaction, reporting which of the two this execution is
/// responsible for.
pub(crate) async fn open_tx(db: &DbAccess, ctx: &mut DbContext) -> DbResult<(bool, bool)> {
    let opened = db.open(ctx).await?;
    match ctx.tx_begin(db.key(), db.strategy()?).await {
        Ok(began) => Ok((opened, began)),
        Err(error) => {
            if opened {
                db.close(ctx).await;
            }
            Err(error)
        }
    }
}

/// Shared tail of the update-flavored executors: commit or roll back if
/// this execution began the transaction, then close if it opened the
/// connection.
pub(crate) async fn settle_tx<T>(
    db: &DbAccess,
    ctx: &mut DbContext,
    opened: bool,
    began: bool,
    result: DbResult<T>,
) -> DbResult<T> {
    let out = match result {
        Ok(value) => {
            if began {
                ctx.tx_commit(db.key()).await.map(|()| value)
            } else {
                Ok(value)
            }
        }
        Err(error) => {
            if began && let Err(rollback_error) = ctx.tx_rollback(db.key()).await {
                warn!(%rollback_error, "rollback failed");
            }
            Err(error)
        }
    };
    if opened {
        db.close(ctx).await;
    }
    out
}

/// Shared tail of the query executor: close if this execution opened.
pub(crate) async fn settle<T>(
    db: &DbAccess,
    ctx: &mut DbContext,
    opened: bool,
    result: DbResult<T>,
) -> DbResult<T> {
    if opened {
        db.close(ctx).await;
    }
    result
}
