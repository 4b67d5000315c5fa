//! The logical execution context.
//!
//! One [`DbContext`] spans one unit of work (a request, a job run, one
//! task's call stack). Every facade built from equal configuration
//! resolves to the same identity key and therefore shares the one
//! connection and transaction held here. The context is an explicit
//! handle threaded through calls; nothing is stored in globals or
//! task-locals.

use crate::db::connection::DbConnection;
use crate::db::transaction::{Strategy, Transaction, TxStatus};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct DbContext {
    id: String,
    connections: HashMap<String, DbConnection>,
    transaction: Option<Transaction>,
    /// Set when an exception handler converted a failure for this
    /// context; cleared on close.
    handled: bool,
}

impl DbContext {
    pub fn new() -> Self {
        Self {
            id: format!("ctx_{}", Uuid::new_v4().simple()),
            connections: HashMap::new(),
            transaction: None,
            handled: false,
        }
    }

    /// Correlation id for logging.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether a connection is held for the identity key.
    pub fn is_open(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Whether a failure was handled in this context. While true, further
    /// `perform`/`transact` units are suppressed and an active
    /// transaction is no longer committable.
    pub fn has_handled_failure(&self) -> bool {
        self.handled
    }

    pub(crate) fn note_handled(&mut self) {
        self.handled = true;
    }

    pub(crate) fn insert_connection(&mut self, key: String, conn: DbConnection) {
        self.connections.insert(key, conn);
    }

    pub(crate) fn connection_mut(&mut self, key: &str) -> DbResult<&mut DbConnection> {
        self.connections
            .get_mut(key)
            .ok_or_else(|| DbError::state(format!("no open connection for '{key}'")))
    }

    /// Begins (or joins) the context transaction. Returns whether this
    /// call started it.
    pub(crate) async fn tx_begin(&mut self, key: &str, strategy: Strategy) -> DbResult<bool> {
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| DbError::state(format!("no open connection for '{key}'")))?;
        let tx = self
            .transaction
            .get_or_insert_with(|| Transaction::new(strategy));
        tx.begin(conn).await
    }

    /// Commits the context transaction; rolls back instead when a handled
    /// failure is on record.
    pub(crate) async fn tx_commit(&mut self, key: &str) -> DbResult<()> {
        let clean = !self.handled;
        let Some(tx) = self.transaction.as_mut() else {
            return Ok(());
        };
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| DbError::state(format!("no open connection for '{key}'")))?;
        tx.commit(conn, clean).await
    }

    pub(crate) async fn tx_rollback(&mut self, key: &str) -> DbResult<()> {
        let Some(tx) = self.transaction.as_mut() else {
            return Ok(());
        };
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| DbError::state(format!("no open connection for '{key}'")))?;
        tx.rollback(conn).await
    }

    /// Current transaction status.
    pub fn transaction_status(&self) -> TxStatus {
        self.transaction
            .as_ref()
            .map(Transaction::status)
            .unwrap_or_default()
    }

    /// Releases everything held for the key: rolls back a transaction
    /// still running, returns the connection to its pool, clears the
    /// handled-failure record.
    pub(crate) async fn release(&mut self, key: &str) {
        if let Some(mut tx) = self.transaction.take() {
            if tx.is_busy() {
                if let Some(conn) = self.connections.get_mut(key) {
                    if let Err(error) = tx.rollback(conn).await {
                        debug!(%error, "rollback on release failed");
                    }
                }
            }
            tx.clear();
        }
        self.connections.remove(key);
        self.handled = false;
        debug!(ctx = %self.id, key, "context resources released");
    }
}
