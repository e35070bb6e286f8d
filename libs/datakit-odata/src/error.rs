//! Error types for query shaping.
//!
//! Failures fall into disjoint classes the hosting layer must tell apart:
//!
//! | Class | Type | Data source touched? | Typical mapping |
//! |-------|------|----------------------|-----------------|
//! | malformed wire input | [`ParseError`] | no | 400 |
//! | policy violation | [`ValidationError`] | no | 400 |
//! | unknown field at composition | [`ShapeError`] | no | 400 |
//! | data-source failure | [`QueryError::Execution`] | yes | 5xx |
//! | cancellation | [`QueryError::Cancelled`] | maybe | 499 |

use std::fmt;

use thiserror::Error;

use crate::report::ValidationReport;
use crate::validate::Violation;

/// Malformed wire input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid value for {option}: '{value}'")]
    InvalidValue { option: &'static str, value: String },

    #[error("invalid $filter: {0}")]
    Filter(String),

    #[error("unsupported $filter construct: {0}")]
    UnsupportedFilter(String),

    #[error("invalid $orderby term '{0}'")]
    OrderBy(String),

    #[error("invalid $expand: {0}")]
    Expand(String),

    #[error("unknown query option '{0}'")]
    UnknownOption(String),

    #[error("duplicate query option '{0}'")]
    DuplicateOption(String),

    #[error("malformed query string: {0}")]
    QueryString(String),
}

/// The request violates the policy. Nothing was executed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("query rejected: {}", summary(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
    pub report: ValidationReport,
}

fn summary(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    #[must_use]
    pub fn codes(&self) -> Vec<String> {
        self.violations.iter().map(Violation::code).collect()
    }
}

/// The request references something the target cannot express.
///
/// Raised while composing the query, before the data source is contacted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' does not support {what}")]
    Unsupported { field: String, what: String },

    #[error("value for '{field}' does not match its type: {detail}")]
    TypeMismatch { field: String, detail: String },

    #[error("unknown navigation path '{0}'")]
    UnknownInclude(String),
}

/// A failure reported by the data source.
///
/// The underlying error is kept as `source` so the causal chain survives.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SourceError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Where in the pipeline an execution failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStage {
    Count,
    Fetch,
}

impl fmt::Display for ExecStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Fetch => f.write_str("fetch"),
        }
    }
}

/// Everything that can go wrong while serving a shaped query.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error("query cannot be applied: {0}")]
    Shape(#[from] ShapeError),

    #[error("data access failed during {stage}")]
    Execution {
        stage: ExecStage,
        #[source]
        source: SourceError,
    },

    #[error("query cancelled during {0}")]
    Cancelled(ExecStage),
}

impl QueryError {
    /// The request was refused before any data-source interaction.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Rejected(_) | Self::Shape(_))
    }

    #[must_use]
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn client_errors_are_distinguishable_from_execution_failures() {
        let rejected = QueryError::Rejected(ValidationError {
            violations: vec![Violation::FilterNotAllowed],
            report: ValidationReport::new(),
        });
        assert!(rejected.is_client_error());
        assert!(rejected.validation().is_some());

        let shape = QueryError::from(ShapeError::UnknownField("x".to_owned()));
        assert!(shape.is_client_error());

        let exec = QueryError::Execution {
            stage: ExecStage::Fetch,
            source: SourceError::new("connection reset"),
        };
        assert!(!exec.is_client_error());
        assert!(exec.validation().is_none());
        assert!(!QueryError::Cancelled(ExecStage::Count).is_client_error());
    }

    #[test]
    fn execution_error_keeps_the_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
        let exec = QueryError::Execution {
            stage: ExecStage::Count,
            source: SourceError::with_source("count query failed", io),
        };

        assert_eq!(exec.to_string(), "data access failed during count");
        let lvl1 = exec.source().unwrap();
        assert_eq!(lvl1.to_string(), "count query failed");
        let lvl2 = lvl1.source().unwrap();
        assert_eq!(lvl2.to_string(), "socket timed out");
    }

    #[test]
    fn validation_error_summarises_violations() {
        let err = ValidationError {
            violations: vec![
                Violation::TopExceedsMax {
                    requested: 500,
                    max: 100,
                },
                Violation::CountNotAllowed,
            ],
            report: ValidationReport::new(),
        };
        assert_eq!(
            err.to_string(),
            "query rejected: $top 500 exceeds the maximum of 100; $count is not allowed"
        );
        assert_eq!(err.codes(), ["Top.ExceedsMax", "Count.NotAllowed"]);
    }
}
