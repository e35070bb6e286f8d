#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Policy-guarded query shaping.
//!
//! A client sends a structured query (`$filter`, `$orderby`, `$top`, `$skip`,
//! `$select`, `$expand`, `$count`) against a dataset the server exposes. This
//! crate decides what the client is allowed to ask for and then applies the
//! request to a security-scoped base query in a fixed order.
//!
//! # Flow
//!
//! ```text
//! wire query ──parse──▶ QueryRequest ──validate(policy)──▶ ValidatedQuery
//!                                          │                     │
//!                                          ▼                     ▼
//!                                   ValidationError      QueryPipeline::run
//!                                 (nothing executed)             │
//!                                                                ▼
//!                                                       ResultEnvelope<T>
//! ```
//!
//! # Example
//!
//! ```rust
//! use datakit_odata::{QueryPolicy, QueryValidator, parse_query_string};
//!
//! let policy = QueryPolicy::builder()
//!     .allow_expand(true)
//!     .allowed_expand(["Orders"])
//!     .build()
//!     .unwrap();
//!
//! let request = parse_query_string("$expand=Orders($expand=Lines)&$top=10").unwrap();
//! let validated = QueryValidator::new(&policy).validate(request).unwrap();
//! let paths: Vec<&str> = validated.includes().iter().collect();
//! assert_eq!(paths, ["Orders", "Orders.Lines"]);
//! ```
//!
//! The storage engine plugs in through [`ShapeableQuery`] and
//! [`QueryExecutor`]; see `datakit-db` for the `SeaORM` implementation and
//! [`memory`] for an in-process one.

pub mod config;
pub mod envelope;
pub mod error;
pub mod expand;
pub mod filter;
pub mod memory;
pub mod parse;
pub mod pipeline;
pub mod policy;
pub mod report;
pub mod request;
pub mod source;
pub mod validate;

pub use config::{QueryPolicyConfig, load_policy, policy_figment};
pub use envelope::{ERROR_CODE_FAILURE, ERROR_CODE_SUCCESS, ResultAssembler, ResultEnvelope};
pub use error::{ExecStage, ParseError, QueryError, ShapeError, SourceError, ValidationError};
pub use expand::{ExpandOutcome, ExpansionWalker, IncludeSet};
pub use filter::{CompareOp, FilterExpr, FilterValue, StringFunction};
pub use parse::parse_query_string;
pub use pipeline::{PipelineSteps, QueryPipeline};
pub use policy::{PolicyConfigError, QueryPolicy, QueryPolicyBuilder};
pub use report::ValidationReport;
pub use request::{ExpandNode, InnerOptions, OrderKey, QueryRequest, SortDir};
pub use source::{QueryExecutor, ShapeableQuery};
pub use validate::{QueryValidator, ValidatedQuery, Violation};
