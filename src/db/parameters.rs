//! Binder state for one statement execution.
//!
//! Arguments arrive either as a flat positional list (statements written
//! with top-level `?` markers) or as the ordered, typed entries a built
//! artifact produced from named tokens. The two forms are mutually
//! exclusive within one execution; mixing them is a state error raised
//! before anything reaches the driver. OUT entries are rejected at the
//! same point: the wire drivers expose no callable-statement surface, so
//! a statement carrying them can never execute.

use crate::error::{DbError, DbResult};
use crate::sql::artifact::ParamEntry;
use crate::sql::param::Direction;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Parameters {
    args: Vec<Value>,
    entries: Vec<ParamEntry>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.entries.is_empty()
    }

    /// Sets positional arguments. The statement must use only `?`
    /// markers, matching in number and order.
    pub fn set_args(&mut self, args: Vec<Value>) -> DbResult<()> {
        if !self.entries.is_empty() {
            return Err(DbError::state(
                "positional arguments and named entries cannot be used together",
            ));
        }
        self.args = args;
        Ok(())
    }

    /// Replaces the entry list with the artifact's build product.
    pub(crate) fn set_entries(&mut self, entries: Vec<ParamEntry>) -> DbResult<()> {
        if !self.args.is_empty() {
            return Err(DbError::state(
                "positional arguments and named entries cannot be used together",
            ));
        }
        self.entries = entries;
        Ok(())
    }

    /// Entry value by parameter name (named-token executions).
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .map(|e| &e.value)
    }

    /// The values to bind, in placeholder order.
    pub(crate) fn bind_values(&self) -> DbResult<Vec<Value>> {
        if !self.args.is_empty() {
            return Ok(self.args.clone());
        }
        self.entries
            .iter()
            .map(|entry| match entry.direction {
                Direction::In => Ok(entry.value.clone()),
                Direction::Out => Err(DbError::state(format!(
                    "OUT parameter '{}' is not supported by this executor",
                    entry.name.as_deref().unwrap_or("?")
                ))),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.args.clear();
        self.entries.clear();
    }
}
