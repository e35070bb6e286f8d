#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! `SeaORM` storage for datakit.
//!
//! - [`connect_db`] opens a pool for a `sqlite:`, `postgres:` or `mysql:` DSN
//! - [`scoped_query`] builds a tenant-restricted base query that the
//!   [`QueryPipeline`](datakit_odata::QueryPipeline) shapes through
//!   [`SeaQuery`] and runs with [`SeaExecutor`]
//! - [`UnitOfWork`] and [`Repository`] cover writes

pub mod connect;
pub mod error;
pub mod odata;
pub mod repo;
pub mod scope;
pub mod uow;

pub use connect::{ConnectOpts, Db, Engine, connect_db, redact_credentials_in_dsn};
pub use error::DbError;
pub use odata::{FieldKind, FieldMap, SeaExecutor, SeaQuery, scoped_query};
pub use repo::Repository;
pub use scope::{AccessScope, ScopableEntity, build_scope_condition};
pub use uow::{UnitOfWork, in_transaction};
