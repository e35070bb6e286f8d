//! Declarative bounds on what a client may request.
//!
//! A [`QueryPolicy`] is built once (usually from configuration) and shared
//! read-only across all in-flight requests, typically behind an `Arc`.

use std::collections::BTreeSet;

use thiserror::Error;

/// Default bound on `$expand` nesting.
pub const DEFAULT_MAX_EXPANSION_DEPTH: u32 = 2;

/// Errors raised while constructing a [`QueryPolicy`].
///
/// These are configuration failures: they surface at startup, never while a
/// request is being served.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyConfigError {
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is out of range (got {value})")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("allow-list '{field}' contains an empty entry")]
    EmptyEntry { field: &'static str },

    #[error("invalid policy configuration: {0}")]
    Source(String),
}

/// What a caller may request from a queryable dataset.
///
/// Allow-lists are permissive when empty: an empty `allowed_order_by` accepts
/// any sort column, an empty `allowed_expand` accepts any navigation path.
/// A non-empty list restricts the dimension to its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPolicy {
    max_top: Option<u64>,
    server_page_size: Option<u64>,
    allow_filter: bool,
    allow_order_by: bool,
    allowed_order_by: BTreeSet<String>,
    allow_select: bool,
    allow_expand: bool,
    allowed_expand: BTreeSet<String>,
    max_expansion_depth: u32,
    allow_count: bool,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            max_top: None,
            server_page_size: None,
            allow_filter: true,
            allow_order_by: false,
            allowed_order_by: BTreeSet::new(),
            allow_select: true,
            allow_expand: false,
            allowed_expand: BTreeSet::new(),
            max_expansion_depth: DEFAULT_MAX_EXPANSION_DEPTH,
            allow_count: true,
        }
    }
}

impl QueryPolicy {
    /// Start a builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> QueryPolicyBuilder {
        QueryPolicyBuilder::default()
    }

    #[must_use]
    pub fn max_top(&self) -> Option<u64> {
        self.max_top
    }

    /// Ceiling applied to the effective page size regardless of `$top`.
    #[must_use]
    pub fn server_page_size(&self) -> Option<u64> {
        self.server_page_size
    }

    #[must_use]
    pub fn allow_filter(&self) -> bool {
        self.allow_filter
    }

    #[must_use]
    pub fn allow_order_by(&self) -> bool {
        self.allow_order_by
    }

    #[must_use]
    pub fn allowed_order_by(&self) -> &BTreeSet<String> {
        &self.allowed_order_by
    }

    #[must_use]
    pub fn allow_select(&self) -> bool {
        self.allow_select
    }

    #[must_use]
    pub fn allow_expand(&self) -> bool {
        self.allow_expand
    }

    #[must_use]
    pub fn allowed_expand(&self) -> &BTreeSet<String> {
        &self.allowed_expand
    }

    #[must_use]
    pub fn max_expansion_depth(&self) -> u32 {
        self.max_expansion_depth
    }

    #[must_use]
    pub fn allow_count(&self) -> bool {
        self.allow_count
    }

    /// Whether `column` may be used in `$orderby`.
    ///
    /// Only consults the allow-list; the `allow_order_by` switch is checked
    /// separately by the validator.
    #[must_use]
    pub fn order_column_allowed(&self, column: &str) -> bool {
        self.allowed_order_by.is_empty() || self.allowed_order_by.contains(column)
    }

    /// Whether a dot-joined expansion path may be included.
    ///
    /// A path is accepted when its root segment or the full path is listed.
    #[must_use]
    pub fn expand_path_allowed(&self, path: &str) -> bool {
        if self.allowed_expand.is_empty() {
            return true;
        }
        let root = path.split('.').next().unwrap_or(path);
        self.allowed_expand.contains(root) || self.allowed_expand.contains(path)
    }

    /// Effective page size for a client-supplied `$top`.
    ///
    /// The server ceiling wins over a larger or absent client value, never the
    /// other way around.
    #[must_use]
    pub fn effective_top(&self, requested: Option<u64>) -> Option<u64> {
        match (requested, self.server_page_size) {
            (Some(top), Some(ceiling)) => Some(top.min(ceiling)),
            (None, Some(ceiling)) => Some(ceiling),
            (top, None) => top,
        }
    }
}

/// Builder with named, defaulted overrides.
///
/// Numeric limits are accepted as signed integers, the way they arrive from
/// configuration, and checked in [`QueryPolicyBuilder::build`].
#[derive(Debug, Clone)]
#[must_use]
pub struct QueryPolicyBuilder {
    max_top: Option<i64>,
    server_page_size: Option<i64>,
    allow_filter: bool,
    allow_order_by: bool,
    allowed_order_by: BTreeSet<String>,
    allow_select: bool,
    allow_expand: bool,
    allowed_expand: BTreeSet<String>,
    max_expansion_depth: i64,
    allow_count: bool,
}

impl Default for QueryPolicyBuilder {
    fn default() -> Self {
        let defaults = QueryPolicy::default();
        Self {
            max_top: None,
            server_page_size: None,
            allow_filter: defaults.allow_filter,
            allow_order_by: defaults.allow_order_by,
            allowed_order_by: defaults.allowed_order_by,
            allow_select: defaults.allow_select,
            allow_expand: defaults.allow_expand,
            allowed_expand: defaults.allowed_expand,
            max_expansion_depth: i64::from(defaults.max_expansion_depth),
            allow_count: defaults.allow_count,
        }
    }
}

impl QueryPolicyBuilder {
    pub fn max_top(mut self, max_top: i64) -> Self {
        self.max_top = Some(max_top);
        self
    }

    pub fn server_page_size(mut self, size: i64) -> Self {
        self.server_page_size = Some(size);
        self
    }

    pub fn allow_filter(mut self, allow: bool) -> Self {
        self.allow_filter = allow;
        self
    }

    pub fn allow_order_by(mut self, allow: bool) -> Self {
        self.allow_order_by = allow;
        self
    }

    pub fn allowed_order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_order_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_select(mut self, allow: bool) -> Self {
        self.allow_select = allow;
        self
    }

    pub fn allow_expand(mut self, allow: bool) -> Self {
        self.allow_expand = allow;
        self
    }

    pub fn allowed_expand<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_expand = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_expansion_depth(mut self, depth: i64) -> Self {
        self.max_expansion_depth = depth;
        self
    }

    pub fn allow_count(mut self, allow: bool) -> Self {
        self.allow_count = allow;
        self
    }

    /// Validate the overrides and freeze the policy.
    ///
    /// # Errors
    /// Returns [`PolicyConfigError`] for negative limits, a zero server page
    /// size, a depth that does not fit in `u32`, or blank allow-list entries.
    pub fn build(self) -> Result<QueryPolicy, PolicyConfigError> {
        let max_top = self
            .max_top
            .map(|v| non_negative("max_top", v))
            .transpose()?;

        let server_page_size = match self.server_page_size {
            Some(0) => return Err(PolicyConfigError::Zero {
                field: "server_page_size",
            }),
            Some(v) => Some(non_negative("server_page_size", v)?),
            None => None,
        };

        let depth = non_negative("max_expansion_depth", self.max_expansion_depth)?;
        let max_expansion_depth =
            u32::try_from(depth).map_err(|_| PolicyConfigError::OutOfRange {
                field: "max_expansion_depth",
                value: self.max_expansion_depth,
            })?;

        if self.allowed_order_by.iter().any(|c| c.trim().is_empty()) {
            return Err(PolicyConfigError::EmptyEntry {
                field: "allowed_order_by",
            });
        }
        if self.allowed_expand.iter().any(|p| p.trim().is_empty()) {
            return Err(PolicyConfigError::EmptyEntry {
                field: "allowed_expand",
            });
        }

        Ok(QueryPolicy {
            max_top,
            server_page_size,
            allow_filter: self.allow_filter,
            allow_order_by: self.allow_order_by,
            allowed_order_by: self.allowed_order_by,
            allow_select: self.allow_select,
            allow_expand: self.allow_expand,
            allowed_expand: self.allowed_expand,
            max_expansion_depth,
            allow_count: self.allow_count,
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, PolicyConfigError> {
    u64::try_from(value).map_err(|_| PolicyConfigError::Negative { field, value })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_everything_but_expand_and_order_by() {
        let policy = QueryPolicy::builder().build().unwrap();
        assert_eq!(policy, QueryPolicy::default());
        assert!(policy.allow_filter());
        assert!(policy.allow_select());
        assert!(policy.allow_count());
        assert!(!policy.allow_expand());
        assert!(!policy.allow_order_by());
        assert_eq!(policy.max_top(), None);
        assert_eq!(policy.server_page_size(), None);
        assert_eq!(policy.max_expansion_depth(), DEFAULT_MAX_EXPANSION_DEPTH);
    }

    #[test]
    fn negative_limits_fail_at_construction() {
        let err = QueryPolicy::builder().max_top(-1).build().unwrap_err();
        assert_eq!(
            err,
            PolicyConfigError::Negative {
                field: "max_top",
                value: -1
            }
        );

        let err = QueryPolicy::builder()
            .max_expansion_depth(-3)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyConfigError::Negative {
                field: "max_expansion_depth",
                ..
            }
        ));

        let err = QueryPolicy::builder()
            .server_page_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, PolicyConfigError::Zero { .. }));
    }

    #[test]
    fn depth_beyond_u32_is_rejected() {
        let err = QueryPolicy::builder()
            .max_expansion_depth(i64::from(u32::MAX) + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, PolicyConfigError::OutOfRange { .. }));
    }

    #[test]
    fn blank_allow_list_entries_are_rejected() {
        let err = QueryPolicy::builder()
            .allowed_order_by(["name", " "])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PolicyConfigError::EmptyEntry {
                field: "allowed_order_by"
            }
        );
    }

    #[test]
    fn empty_allow_lists_are_permissive() {
        let policy = QueryPolicy::default();
        assert!(policy.order_column_allowed("anything"));
        assert!(policy.expand_path_allowed("Orders.Lines"));
    }

    #[test]
    fn expand_allow_list_matches_root_or_full_path() {
        let policy = QueryPolicy::builder()
            .allow_expand(true)
            .allowed_expand(["Orders", "Customer.Address"])
            .build()
            .unwrap();

        assert!(policy.expand_path_allowed("Orders"));
        assert!(policy.expand_path_allowed("Orders.Lines"));
        assert!(policy.expand_path_allowed("Customer.Address"));
        assert!(!policy.expand_path_allowed("Customer"));
        assert!(!policy.expand_path_allowed("Invoices"));
    }

    #[test]
    fn server_page_size_caps_client_top() {
        let policy = QueryPolicy::builder().server_page_size(25).build().unwrap();
        assert_eq!(policy.effective_top(Some(1000)), Some(25));
        assert_eq!(policy.effective_top(Some(10)), Some(10));
        assert_eq!(policy.effective_top(None), Some(25));

        let open = QueryPolicy::default();
        assert_eq!(open.effective_top(Some(1000)), Some(1000));
        assert_eq!(open.effective_top(None), None);
    }
}
