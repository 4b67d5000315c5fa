//! Database access toolkit: templated SQL sheets, metadata-driven ORM
//! statements, and a shared connection/transaction lifecycle.
//!
//! The crate has three cooperating parts:
//!
//! - The **template engine** parses SQL text and sheet fragments with
//!   `#{}`/`${}` tokens and nested `if`/`foreach`/`sql`-reference control
//!   nodes into cacheable instruction trees, and builds them against
//!   named values into executable statements with ordered bind
//!   parameters.
//! - The **ORM layer** introspects table shapes once per table and
//!   derives INSERT/UPDATE/DELETE/SELECT statements from declared
//!   property↔column mappings; the generated statements flow through the
//!   same builder and execution path as hand-written ones.
//! - The **execution layer** shares one connection and one transaction
//!   per logical execution context ([`DbContext`]); `perform`/`transact`
//!   on [`DbAccess`] flatten arbitrarily nested calls into a single
//!   physical resource lifecycle with one commit or rollback at the
//!   outermost call.

pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod eval;
pub mod registry;
pub mod sql;

pub use config::Config;
pub use data::{DataList, DataRow, Dataset, Fetch};
pub use db::access::DbAccess;
pub use db::batch::Batch;
pub use db::connection::{Backend, DbConnection, DbPool};
pub use db::context::DbContext;
pub use db::parameters::Parameters;
pub use db::query::Query;
pub use db::transaction::{Transaction, TransactionCoordinator, TxStatus};
pub use db::update::Update;
pub use error::{DbError, DbResult};
pub use eval::{BeanContext, Evaluator};
pub use registry::Registry;
pub use sql::artifact::{ParamEntry, SqlArtifact};
pub use sql::builder::SqlBuilder;
