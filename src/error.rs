//! Error types for the toolkit.
//!
//! All fallible operations return [`DbResult`]. The variants follow the
//! failure taxonomy: configuration and mapping errors are fatal at load or
//! first use, execution errors carry the driver root cause, resource-state
//! errors are detected eagerly before any statement reaches the wire.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Bad or missing configuration: connection entries, sheet documents,
    /// duplicate or malformed fragment ids.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Malformed `#{}`/`${}` token or test expression.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// No ORM mapping for a type, or a declared property without a table
    /// column (and vice versa for auto-increment columns).
    #[error("mapping error: {message} (subject: {subject})")]
    Mapping { message: String, subject: String },

    /// Failure reported by the database.
    #[error("database error: {message}")]
    Database {
        message: String,
        /// e.g. "42P01" for an undefined table
        sql_state: Option<String>,
        #[source]
        source: Option<Box<sqlx::Error>>,
    },

    /// Could not reach or keep the connection to the database.
    #[error("connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<sqlx::Error>>,
    },

    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Illegal executor state: mixing positional and named parameter
    /// styles, OUT tokens on a statement the driver cannot run, and the
    /// like. Raised before binding where possible.
    #[error("invalid state: {message}")]
    State { message: String },

    /// A failure was already handled in this execution context; further
    /// work units are suppressed until the context closes.
    #[error("a failure was already handled in this execution context")]
    Halted,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn mapping(message: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
            subject: subject.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is the sentinel raised when the execution context has
    /// already handled a failure. Never routed to exception handlers.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }

    /// SQLSTATE code reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Convert sqlx errors, preserving the driver failure as the source.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let sql_state = db_err.code().map(|c| c.to_string());
                DbError::Database {
                    message,
                    sql_state,
                    source: Some(Box::new(err)),
                }
            }
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DbError::Connection {
                message: err.to_string(),
                source: Some(Box::new(err)),
            },
            sqlx::Error::ColumnNotFound(col) => DbError::Database {
                message: format!("column not found: {col}"),
                sql_state: None,
                source: Some(Box::new(err)),
            },
            _ => DbError::Database {
                message: err.to_string(),
                sql_state: None,
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Result type alias for toolkit operations.
pub type DbResult<T> = Result<T, DbError>;
