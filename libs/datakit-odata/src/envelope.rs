//! Response envelope returned to callers.

use std::error::Error as StdError;
use std::fmt::Write as _;

use serde::Serialize;

/// `error_code` of a successful envelope.
pub const ERROR_CODE_SUCCESS: i32 = 0;

/// `error_code` of an envelope built from a failure.
pub const ERROR_CODE_FAILURE: i32 = -1;

const INNER_PREFIX: &str = "Inner exception: ";

/// One page of results plus pagination metadata.
///
/// The pipeline only ever returns successful envelopes; failures travel as
/// [`crate::QueryError`]. Hosting layers that must answer with an envelope in
/// every case convert the error with [`ResultEnvelope::from_error`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope<T> {
    pub items: Vec<T>,
    pub total_count: Option<u64>,
    pub page_number: u64,
    pub error_code: i32,
    pub error_message: String,
    pub error_detail: String,
}

impl<T> ResultEnvelope<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_code == ERROR_CODE_SUCCESS
    }

    /// Envelope describing `err` and its whole `source()` chain.
    ///
    /// `error_message` is the outermost message; `error_detail` lists every
    /// level, nested ones on their own line prefixed with
    /// `Inner exception: `.
    #[must_use]
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        ResultAssembler::failure(err)
    }

    /// Convert the items, keeping the metadata.
    pub fn map<U, F>(self, f: F) -> ResultEnvelope<U>
    where
        F: FnMut(T) -> U,
    {
        ResultEnvelope {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page_number: self.page_number,
            error_code: self.error_code,
            error_message: self.error_message,
            error_detail: self.error_detail,
        }
    }
}

/// Builds [`ResultEnvelope`]s.
#[derive(Debug, Clone, Copy)]
pub struct ResultAssembler;

impl ResultAssembler {
    #[must_use]
    pub fn success<T>(items: Vec<T>, total_count: Option<u64>, page_number: u64) -> ResultEnvelope<T> {
        ResultEnvelope {
            items,
            total_count,
            page_number,
            error_code: ERROR_CODE_SUCCESS,
            error_message: String::new(),
            error_detail: String::new(),
        }
    }

    #[must_use]
    pub fn failure<T>(err: &(dyn StdError + 'static)) -> ResultEnvelope<T> {
        ResultEnvelope {
            items: Vec::new(),
            total_count: None,
            page_number: 1,
            error_code: ERROR_CODE_FAILURE,
            error_message: err.to_string(),
            error_detail: flatten_chain(err),
        }
    }
}

/// Render `err` and its causes, one level per line.
#[must_use]
pub fn flatten_chain(err: &(dyn StdError + 'static)) -> String {
    let mut detail = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        let _ = write!(detail, "\n{INNER_PREFIX}{inner}");
        cause = inner.source();
    }
    detail
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::{ExecStage, QueryError, SourceError};

    #[test]
    fn success_envelope_has_zero_error_code() {
        let env = ResultAssembler::success(vec![1, 2], Some(7), 2);
        assert!(env.is_success());
        assert_eq!(env.total_count, Some(7));
        assert!(env.error_message.is_empty());
        assert!(env.error_detail.is_empty());
    }

    #[test]
    fn failure_envelope_flattens_the_cause_chain() {
        let io = std::io::Error::other("connection refused");
        let err = QueryError::Execution {
            stage: ExecStage::Fetch,
            source: SourceError::with_source("select failed", io),
        };

        let env: ResultEnvelope<u8> = ResultEnvelope::from_error(&err);

        assert_eq!(env.error_code, ERROR_CODE_FAILURE);
        assert!(!env.is_success());
        assert!(env.items.is_empty());
        assert_eq!(env.error_message, "data access failed during fetch");
        assert_eq!(
            env.error_detail,
            "data access failed during fetch\n\
             Inner exception: select failed\n\
             Inner exception: connection refused"
        );
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let env = ResultAssembler::success(vec!["a"], None, 1);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["totalCount"], serde_json::Value::Null);
        assert_eq!(json["pageNumber"], 1);
        assert_eq!(json["errorCode"], 0);
        assert_eq!(json["items"][0], "a");
    }

    #[test]
    fn map_keeps_metadata() {
        let env = ResultAssembler::success(vec![1, 2, 3], Some(3), 1).map(|n| n * 10);
        assert_eq!(env.items, [10, 20, 30]);
        assert_eq!(env.total_count, Some(3));
    }
}
