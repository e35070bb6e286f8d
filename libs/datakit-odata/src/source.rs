//! The seam where a storage engine plugs into the pipeline.
//!
//! A base query is whatever the hosting application built before any client
//! input was considered (tenant scoping, soft-delete filters, ...). The
//! pipeline only ever narrows it through [`ShapeableQuery`] and executes it
//! through [`QueryExecutor`].

use async_trait::async_trait;

use crate::error::{ShapeError, SourceError};
use crate::filter::FilterExpr;
use crate::request::OrderKey;

/// A composable, not-yet-executed query.
///
/// Implementations must keep every constraint the value already carries:
/// [`ShapeableQuery::and_filter`] narrows, it never replaces.
pub trait ShapeableQuery: Sized + Send + Sync {
    /// Add `filter` with logical AND.
    ///
    /// # Errors
    /// Returns [`ShapeError`] when the filter references unknown fields or
    /// uses an operation the target cannot express.
    fn and_filter(self, filter: &FilterExpr) -> Result<Self, ShapeError>;

    /// Apply ordering, first key most significant.
    ///
    /// # Errors
    /// Returns [`ShapeError`] for unknown or unsortable fields.
    fn order_by(self, keys: &[OrderKey]) -> Result<Self, ShapeError>;

    #[must_use]
    fn skip(self, n: u64) -> Self;

    #[must_use]
    fn take(self, n: u64) -> Self;

    /// Ask for a related entity to be loaded alongside each item.
    ///
    /// The default ignores the path.
    ///
    /// # Errors
    /// Returns [`ShapeError::UnknownInclude`] when the target knows its
    /// navigations and `path` is not one of them.
    fn include(self, path: &str) -> Result<Self, ShapeError> {
        let _ = path;
        Ok(self)
    }

    /// Restrict materialised fields.
    ///
    /// The default keeps every field.
    ///
    /// # Errors
    /// Returns [`ShapeError::UnknownField`] when the target knows its fields
    /// and one of `fields` is not among them.
    fn select(self, fields: &[String]) -> Result<Self, ShapeError> {
        let _ = fields;
        Ok(self)
    }
}

/// Executes queries against the data source.
///
/// These are the only two points where the pipeline suspends on I/O.
#[async_trait]
pub trait QueryExecutor<Q>: Send + Sync
where
    Q: ShapeableQuery,
{
    type Item: Send;

    /// Number of rows matching `query`, ignoring any paging.
    ///
    /// # Errors
    /// Returns [`SourceError`] when the data source fails.
    async fn count(&self, query: &Q) -> Result<u64, SourceError>;

    /// Materialise the rows of `query`.
    ///
    /// # Errors
    /// Returns [`SourceError`] when the data source fails.
    async fn fetch(&self, query: Q) -> Result<Vec<Self::Item>, SourceError>;
}
