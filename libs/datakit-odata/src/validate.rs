//! Policy validation of a structured query request.
//!
//! [`QueryValidator::validate`] checks every dimension in one pass and either
//! returns a [`ValidatedQuery`] (the only input [`crate::QueryPipeline`]
//! accepts) or a [`ValidationError`] listing every violation. A rejected
//! request never reaches the data source.

use std::fmt;

use thiserror::Error;

use crate::error::ValidationError;
use crate::expand::{ExpansionWalker, IncludeSet};
use crate::policy::QueryPolicy;
use crate::report::ValidationReport;
use crate::request::QueryRequest;

/// A single policy violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("$filter is not allowed")]
    FilterNotAllowed,

    #[error("$orderby is not allowed")]
    OrderByNotAllowed,

    #[error("ordering by '{column}' is not allowed")]
    OrderByColumnNotAllowed { column: String },

    #[error("$top {requested} exceeds the maximum of {max}")]
    TopExceedsMax { requested: u64, max: u64 },

    #[error("$select is not allowed")]
    SelectNotAllowed,

    #[error("$count is not allowed")]
    CountNotAllowed,

    #[error("$expand is not allowed")]
    ExpandNotAllowed,

    #[error("none of the requested expansions are allowed")]
    ExpandAllRejected,
}

impl Violation {
    /// Stable diagnostic code, also appended to the [`ValidationReport`].
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::FilterNotAllowed => "Filter.NotAllowed".to_owned(),
            Self::OrderByNotAllowed => "OrderBy.NotAllowed".to_owned(),
            Self::OrderByColumnNotAllowed { column } => {
                format!("OrderBy.ColumnNotAllowed:{column}")
            }
            Self::TopExceedsMax { .. } => "Top.ExceedsMax".to_owned(),
            Self::SelectNotAllowed => "Select.NotAllowed".to_owned(),
            Self::CountNotAllowed => "Count.NotAllowed".to_owned(),
            Self::ExpandNotAllowed => "Expand.NotAllowed".to_owned(),
            Self::ExpandAllRejected => "Expand.AllRejected".to_owned(),
        }
    }

    /// The query option the violation is about.
    #[must_use]
    pub fn option(&self) -> &'static str {
        match self {
            Self::FilterNotAllowed => "$filter",
            Self::OrderByNotAllowed | Self::OrderByColumnNotAllowed { .. } => "$orderby",
            Self::TopExceedsMax { .. } => "$top",
            Self::SelectNotAllowed => "$select",
            Self::CountNotAllowed => "$count",
            Self::ExpandNotAllowed | Self::ExpandAllRejected => "$expand",
        }
    }
}

/// A request that passed validation, ready for the pipeline.
///
/// Only [`QueryValidator::validate`] can build one.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    request: QueryRequest,
    includes: IncludeSet,
    report: ValidationReport,
}

impl ValidatedQuery {
    #[must_use]
    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Expansion paths that survived the walker.
    #[must_use]
    pub fn includes(&self) -> &IncludeSet {
        &self.includes
    }

    /// Diagnostics gathered while validating (dropped expansion branches).
    #[must_use]
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }
}

impl fmt::Display for ValidatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.request;
        write!(
            f,
            "filter={} order_by={} top={:?} skip={:?} select={} includes={} count={}",
            r.filter.is_some(),
            r.order_by.len(),
            r.top,
            r.skip,
            r.select.len(),
            self.includes.len(),
            r.count
        )
    }
}

/// Validates requests against one policy.
#[derive(Debug, Clone, Copy)]
pub struct QueryValidator<'p> {
    policy: &'p QueryPolicy,
}

impl<'p> QueryValidator<'p> {
    #[must_use]
    pub fn new(policy: &'p QueryPolicy) -> Self {
        Self { policy }
    }

    /// Check every dimension of `request`.
    ///
    /// # Errors
    /// Returns [`ValidationError`] with all violations found when any
    /// dimension exceeds the policy.
    pub fn validate(&self, request: QueryRequest) -> Result<ValidatedQuery, ValidationError> {
        let policy = self.policy;
        let mut violations = Vec::new();

        if request.filter.is_some() && !policy.allow_filter() {
            violations.push(Violation::FilterNotAllowed);
        }

        if !request.order_by.is_empty() {
            if policy.allow_order_by() {
                for key in &request.order_by {
                    if !policy.order_column_allowed(&key.field) {
                        violations.push(Violation::OrderByColumnNotAllowed {
                            column: key.field.clone(),
                        });
                    }
                }
            } else {
                violations.push(Violation::OrderByNotAllowed);
            }
        }

        if let (Some(requested), Some(max)) = (request.top, policy.max_top())
            && requested > max
        {
            violations.push(Violation::TopExceedsMax { requested, max });
        }

        if !request.select.is_empty() && !policy.allow_select() {
            violations.push(Violation::SelectNotAllowed);
        }

        if request.count && !policy.allow_count() {
            violations.push(Violation::CountNotAllowed);
        }

        let outcome = ExpansionWalker::new(policy).walk(&request.expand);
        if !request.expand.is_empty() {
            if !policy.allow_expand() {
                violations.push(Violation::ExpandNotAllowed);
            } else if outcome.all_rejected() {
                violations.push(Violation::ExpandAllRejected);
            }
        }

        let mut report = outcome.report;
        for v in &violations {
            report.push(v.code());
        }

        if violations.is_empty() {
            if !report.is_empty() {
                tracing::debug!(report = %report, "query accepted with ignored expansions");
            }
            Ok(ValidatedQuery {
                request,
                includes: outcome.paths,
                report,
            })
        } else {
            tracing::debug!(report = %report, "query rejected by policy");
            Err(ValidationError { violations, report })
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::filter::FilterExpr;
    use crate::report::EXPAND_IGNORED_MAX_DEPTH;
    use crate::request::{ExpandNode, OrderKey};
    use tracing_test::traced_test;

    fn violations(policy: &QueryPolicy, request: QueryRequest) -> Vec<Violation> {
        QueryValidator::new(policy)
            .validate(request)
            .unwrap_err()
            .violations
    }

    #[test]
    fn empty_request_is_valid_under_defaults() {
        let policy = QueryPolicy::default();
        let validated = QueryValidator::new(&policy)
            .validate(QueryRequest::default())
            .unwrap();
        assert!(validated.includes().is_empty());
        assert!(validated.report().is_empty());
    }

    #[test]
    fn top_above_max_is_rejected() {
        let policy = QueryPolicy::builder().max_top(100).build().unwrap();

        let v = violations(&policy, QueryRequest::default().with_top(101));
        assert_eq!(
            v,
            [Violation::TopExceedsMax {
                requested: 101,
                max: 100
            }]
        );

        assert!(
            QueryValidator::new(&policy)
                .validate(QueryRequest::default().with_top(100))
                .is_ok()
        );
    }

    #[test]
    fn order_by_is_off_by_default() {
        let policy = QueryPolicy::default();
        let v = violations(&policy, QueryRequest::default().with_order(OrderKey::asc("name")));
        assert_eq!(v, [Violation::OrderByNotAllowed]);
    }

    #[test]
    fn order_by_columns_are_checked_against_allow_list() {
        let policy = QueryPolicy::builder()
            .allow_order_by(true)
            .allowed_order_by(["name", "created_at"])
            .build()
            .unwrap();

        let request = QueryRequest::default()
            .with_order(OrderKey::asc("name"))
            .with_order(OrderKey::desc("salary"));
        let v = violations(&policy, request);
        assert_eq!(
            v,
            [Violation::OrderByColumnNotAllowed {
                column: "salary".to_owned()
            }]
        );
    }

    #[test]
    fn any_order_column_is_accepted_without_allow_list() {
        let policy = QueryPolicy::builder().allow_order_by(true).build().unwrap();
        let request = QueryRequest::default().with_order(OrderKey::desc("whatever"));
        assert!(QueryValidator::new(&policy).validate(request).is_ok());
    }

    #[test]
    fn every_violation_is_collected() {
        let policy = QueryPolicy::builder()
            .allow_filter(false)
            .allow_select(false)
            .allow_count(false)
            .max_top(10)
            .build()
            .unwrap();

        let request = QueryRequest::default()
            .with_filter(FilterExpr::eq("a", 1))
            .with_select(["a"])
            .with_count(true)
            .with_top(11)
            .with_expand(ExpandNode::new("Orders"));

        let err = QueryValidator::new(&policy).validate(request).unwrap_err();
        assert_eq!(
            err.codes(),
            [
                "Filter.NotAllowed",
                "Top.ExceedsMax",
                "Select.NotAllowed",
                "Count.NotAllowed",
                "Expand.NotAllowed",
            ]
        );
        assert!(err.report.contains("Expand.NotAllowed"));
    }

    #[test]
    fn expand_disabled_rejects_any_expansion() {
        let policy = QueryPolicy::default();
        let v = violations(&policy, QueryRequest::default().with_expand(ExpandNode::new("Orders")));
        assert_eq!(v, [Violation::ExpandNotAllowed]);
    }

    #[test]
    fn all_rejected_expansion_is_a_hard_failure() {
        let policy = QueryPolicy::builder()
            .allow_expand(true)
            .allowed_expand(["Orders"])
            .build()
            .unwrap();
        let err = QueryValidator::new(&policy)
            .validate(QueryRequest::default().with_expand(ExpandNode::new("Invoices")))
            .unwrap_err();
        assert_eq!(err.violations, [Violation::ExpandAllRejected]);
        assert_eq!(
            err.report.codes(),
            ["ExpandIgnored.NotAllowed", "Expand.AllRejected"]
        );
    }

    #[test]
    #[traced_test]
    fn partially_rejected_expansion_passes_with_report() {
        let policy = QueryPolicy::builder()
            .allow_expand(true)
            .max_expansion_depth(1)
            .build()
            .unwrap();
        let request = QueryRequest::default()
            .with_expand(ExpandNode::new("Orders").with_nested(ExpandNode::new("Lines")));

        let validated = QueryValidator::new(&policy).validate(request).unwrap();

        assert_eq!(validated.includes().iter().collect::<Vec<_>>(), ["Orders"]);
        assert_eq!(validated.report().codes(), [EXPAND_IGNORED_MAX_DEPTH]);
        assert!(logs_contain("query accepted with ignored expansions"));
    }

    #[test]
    fn select_and_expand_are_independent() {
        let policy = QueryPolicy::builder()
            .allow_expand(true)
            .allowed_expand(["Orders"])
            .build()
            .unwrap();
        // Selecting a field that happens to share a name with a forbidden
        // navigation is not an expansion.
        let request = QueryRequest::default()
            .with_select(["Invoices"])
            .with_expand(ExpandNode::new("Orders"));
        assert!(QueryValidator::new(&policy).validate(request).is_ok());
    }

    #[test]
    fn violation_options_name_the_offending_parameter() {
        assert_eq!(Violation::ExpandAllRejected.option(), "$expand");
        assert_eq!(
            Violation::OrderByColumnNotAllowed {
                column: "x".to_owned()
            }
            .option(),
            "$orderby"
        );
    }
}
