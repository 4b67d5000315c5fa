//! The database transaction state machine.
//!
//! A transaction is created lazily per execution context and released when
//! the context closes. Three interchangeable strategies share one
//! contract (`begin` / `is_committable` / `commit` / `rollback` / `clear`):
//!
//! - **Local** drives the held connection directly.
//! - **User** delegates to a registered [`TransactionCoordinator`] the way
//!   application-managed transactions do.
//! - **Manager** delegates to a registered coordinator owned by an outer
//!   runtime; rollback is requested with `set_rollback_only` and commit is
//!   issued only when this context started the transaction.

use crate::db::connection::DbConnection;
use crate::error::DbResult;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxStatus {
    #[default]
    NoTransaction,
    Active,
    Committed,
    RolledBack,
}

/// External handle for delegated transaction control.
pub trait TransactionCoordinator: Send + Sync {
    fn begin(&self) -> BoxFuture<'_, DbResult<()>>;
    fn commit(&self) -> BoxFuture<'_, DbResult<()>>;
    fn rollback(&self) -> BoxFuture<'_, DbResult<()>>;
    /// Marks the transaction so the owning runtime rolls it back.
    fn set_rollback_only(&self) -> BoxFuture<'_, DbResult<()>>;
    fn status(&self) -> TxStatus;
}

/// How transaction control is carried out for a datasource.
#[derive(Clone)]
pub enum Strategy {
    Local,
    User(Arc<dyn TransactionCoordinator>),
    Manager(Arc<dyn TransactionCoordinator>),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Local => write!(f, "Local"),
            Strategy::User(_) => write!(f, "User"),
            Strategy::Manager(_) => write!(f, "Manager"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    strategy: Strategy,
    busy: bool,
    status: TxStatus,
    /// Whether this context's begin() actually started the delegated
    /// transaction (Manager strategy).
    started: bool,
}

impl Transaction {
    pub(crate) fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            busy: false,
            status: TxStatus::NoTransaction,
            started: false,
        }
    }

    pub fn status(&self) -> TxStatus {
        match &self.strategy {
            Strategy::Local => self.status,
            Strategy::User(c) | Strategy::Manager(c) => c.status(),
        }
    }

    /// Begins a transaction. Returns whether this call started it; `false`
    /// means a transaction is already running and the caller must not
    /// commit or roll back.
    pub async fn begin(&mut self, conn: &mut DbConnection) -> DbResult<bool> {
        if self.busy {
            return Ok(false);
        }
        self.busy = true;
        let started = match &self.strategy {
            Strategy::Local => {
                conn.begin().await?;
                self.status = TxStatus::Active;
                true
            }
            Strategy::User(coordinator) => {
                if coordinator.status() == TxStatus::NoTransaction {
                    coordinator.begin().await?;
                    true
                } else {
                    false
                }
            }
            Strategy::Manager(coordinator) => {
                if coordinator.status() == TxStatus::NoTransaction {
                    coordinator.begin().await?;
                    self.started = true;
                    true
                } else {
                    self.started = false;
                    false
                }
            }
        };
        if started {
            debug!(strategy = ?self.strategy, "transaction started");
        }
        Ok(started)
    }

    /// A transaction is committable while it is active and the execution
    /// context has no handled failure on record.
    pub fn is_committable(&self, context_clean: bool) -> bool {
        self.busy && context_clean
    }

    /// Commits, or rolls back instead when the transaction is not
    /// committable.
    pub async fn commit(&mut self, conn: &mut DbConnection, context_clean: bool) -> DbResult<()> {
        if !self.busy {
            return Ok(());
        }
        if !self.is_committable(context_clean) {
            return self.rollback(conn).await;
        }
        let result = match &self.strategy {
            Strategy::Local => {
                let result = conn.commit().await;
                if result.is_ok() {
                    self.status = TxStatus::Committed;
                }
                result
            }
            Strategy::User(coordinator) => {
                if coordinator.status() == TxStatus::Active {
                    coordinator.commit().await
                } else {
                    Ok(())
                }
            }
            Strategy::Manager(coordinator) => {
                if self.started && coordinator.status() == TxStatus::Active {
                    coordinator.commit().await
                } else {
                    Ok(())
                }
            }
        };
        self.busy = false;
        if result.is_ok() {
            debug!(strategy = ?self.strategy, "transaction committed");
        }
        result
    }

    pub async fn rollback(&mut self, conn: &mut DbConnection) -> DbResult<()> {
        if !self.busy {
            return Ok(());
        }
        let result = match &self.strategy {
            Strategy::Local => {
                let result = conn.rollback().await;
                if result.is_ok() {
                    self.status = TxStatus::RolledBack;
                }
                result
            }
            Strategy::User(coordinator) => {
                if coordinator.status() == TxStatus::Active {
                    coordinator.rollback().await
                } else {
                    Ok(())
                }
            }
            Strategy::Manager(coordinator) => {
                if coordinator.status() == TxStatus::Active {
                    coordinator.set_rollback_only().await
                } else {
                    Ok(())
                }
            }
        };
        self.busy = false;
        if result.is_ok() {
            debug!(strategy = ?self.strategy, "transaction rolled back");
        }
        result
    }

    /// Releases the transaction, returning its final status.
    pub(crate) fn clear(&mut self) -> TxStatus {
        let status = self.status();
        self.busy = false;
        self.started = false;
        status
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }
}
