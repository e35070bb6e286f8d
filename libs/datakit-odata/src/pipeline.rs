//! Deterministic application of a validated request to a base query.
//!
//! Order is fixed:
//!
//! 1. `$filter` (AND with the base query's own constraints)
//! 2. count on the filtered query
//! 3. zero count: return an empty page, nothing else runs
//! 4. `$orderby`
//! 5. `$skip`
//! 6. `$top`, capped by the policy's server page size
//! 7. include paths and `$select` (never change which rows are returned)
//! 8. fetch
//! 9. page number = `skip / top + 1` when both were applied, otherwise 1
//!
//! Each step can be switched off with [`PipelineSteps`]; switching one off
//! never reorders the others.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::envelope::{ResultAssembler, ResultEnvelope};
use crate::error::{ExecStage, QueryError, SourceError, ValidationError};
use crate::policy::QueryPolicy;
use crate::request::QueryRequest;
use crate::source::{QueryExecutor, ShapeableQuery};
use crate::validate::{QueryValidator, ValidatedQuery};

/// Per-step switches. Everything is on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct PipelineSteps {
    pub filter: bool,
    pub count: bool,
    pub order: bool,
    pub skip: bool,
    pub top: bool,
}

impl Default for PipelineSteps {
    fn default() -> Self {
        Self {
            filter: true,
            count: true,
            order: true,
            skip: true,
            top: true,
        }
    }
}

impl PipelineSteps {
    /// All steps except the count; no short-circuit and no total is reported.
    #[must_use]
    pub fn without_count() -> Self {
        Self {
            count: false,
            ..Self::default()
        }
    }

    /// Filtering and counting only; the full filtered set is fetched.
    #[must_use]
    pub fn unpaged() -> Self {
        Self {
            skip: false,
            top: false,
            ..Self::default()
        }
    }
}

/// Validates requests and applies them to base queries.
///
/// The pipeline borrows the policy; one policy instance can serve any number
/// of concurrent pipelines.
#[derive(Debug, Clone)]
pub struct QueryPipeline<'p> {
    policy: &'p QueryPolicy,
    steps: PipelineSteps,
    cancel: Option<CancellationToken>,
}

impl<'p> QueryPipeline<'p> {
    #[must_use]
    pub fn new(policy: &'p QueryPolicy) -> Self {
        Self {
            policy,
            steps: PipelineSteps::default(),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_steps(mut self, steps: PipelineSteps) -> Self {
        self.steps = steps;
        self
    }

    /// Abort at the count or fetch await point once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &QueryPolicy {
        self.policy
    }

    /// Validate `request` against the pipeline's policy.
    ///
    /// # Errors
    /// Returns [`ValidationError`] listing every violation.
    pub fn validate(&self, request: QueryRequest) -> Result<ValidatedQuery, ValidationError> {
        QueryValidator::new(self.policy).validate(request)
    }

    /// Validate and run in one go. Nothing is executed on rejection.
    ///
    /// # Errors
    /// Returns [`QueryError::Rejected`] on policy violations, otherwise the
    /// errors of [`QueryPipeline::run`].
    pub async fn execute<Q, X>(
        &self,
        base: Q,
        executor: &X,
        request: QueryRequest,
    ) -> Result<ResultEnvelope<X::Item>, QueryError>
    where
        Q: ShapeableQuery,
        X: QueryExecutor<Q>,
    {
        let validated = self.validate(request)?;
        self.run(base, executor, &validated).await
    }

    /// Apply `validated` to `base` and execute it.
    ///
    /// # Errors
    /// - [`QueryError::Shape`] when the target cannot express the request
    /// - [`QueryError::Execution`] when count or fetch fails
    /// - [`QueryError::Cancelled`] when the cancellation token fires
    #[tracing::instrument(skip_all, fields(query = %validated))]
    pub async fn run<Q, X>(
        &self,
        base: Q,
        executor: &X,
        validated: &ValidatedQuery,
    ) -> Result<ResultEnvelope<X::Item>, QueryError>
    where
        Q: ShapeableQuery,
        X: QueryExecutor<Q>,
    {
        let request = validated.request();
        let mut query = base;

        if self.steps.filter
            && let Some(filter) = &request.filter
        {
            query = query.and_filter(filter)?;
        }

        let total = if self.steps.count {
            let total = self
                .guarded(ExecStage::Count, executor.count(&query))
                .await?;
            tracing::debug!(total, "counted filtered rows");
            if total == 0 {
                tracing::debug!("empty result, skipping fetch");
                return Ok(ResultAssembler::success(Vec::new(), Some(0), 1));
            }
            Some(total)
        } else {
            None
        };

        if self.steps.order && !request.order_by.is_empty() {
            query = query.order_by(&request.order_by)?;
        }

        let skip = if self.steps.skip { request.skip } else { None };
        if let Some(n) = skip {
            query = query.skip(n);
        }

        let top = if self.steps.top {
            self.policy.effective_top(request.top)
        } else {
            None
        };
        if let Some(n) = top {
            if request.top != Some(n) {
                tracing::debug!(requested = ?request.top, applied = n, "server page size applied");
            }
            query = query.take(n);
        }

        for path in validated.includes().iter() {
            query = query.include(path)?;
        }
        if !request.select.is_empty() {
            query = query.select(&request.select)?;
        }

        let items = self
            .guarded(ExecStage::Fetch, executor.fetch(query))
            .await?;

        let page = page_number(skip, top);
        tracing::debug!(items = items.len(), page, "fetched page");

        Ok(ResultAssembler::success(items, total, page))
    }

    async fn guarded<T, F>(&self, stage: ExecStage, fut: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        let result = match &self.cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(QueryError::Cancelled(stage));
                }
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(QueryError::Cancelled(stage)),
                    r = fut => r,
                }
            }
            None => fut.await,
        };

        result.map_err(|source| {
            tracing::warn!(%stage, error = %source, "data source failure");
            QueryError::Execution { stage, source }
        })
    }
}

/// 1-based page index for an applied skip/top pair.
fn page_number(skip: Option<u64>, top: Option<u64>) -> u64 {
    match (skip, top) {
        (Some(skip), Some(top)) => skip.checked_div(top).map_or(1, |p| p + 1),
        _ => 1,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn page_number_follows_skip_over_top() {
        assert_eq!(page_number(Some(20), Some(10)), 3);
        assert_eq!(page_number(Some(0), Some(10)), 1);
        assert_eq!(page_number(Some(25), Some(10)), 3);
        assert_eq!(page_number(Some(5), None), 1);
        assert_eq!(page_number(None, Some(10)), 1);
        assert_eq!(page_number(Some(5), Some(0)), 1);
    }

    #[test]
    fn step_presets() {
        assert!(!PipelineSteps::without_count().count);
        let unpaged = PipelineSteps::unpaged();
        assert!(!unpaged.skip && !unpaged.top && unpaged.count);
    }
}
