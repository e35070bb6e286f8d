//! In-process data source.
//!
//! [`MemorySource`] executes [`MemoryQuery`] values over a `Vec` of records.
//! It backs the CLI's `run` command and doubles as an instrumented executor
//! in tests: it counts invocations, remembers every query it was handed, and
//! can be told to fail or to stall.
//!
//! Filter semantics follow SQL three-valued logic: a comparison against a
//! missing or null field is unknown except `eq null` and `ne null`, unknown
//! propagates through `not`, `and` and `or`, and only rows that evaluate to
//! true match. Ascending order puts nulls first.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{ExecStage, ShapeError, SourceError};
use crate::filter::{CompareOp, FilterExpr, FilterValue, StringFunction};
use crate::request::{OrderKey, SortDir};
use crate::source::{QueryExecutor, ShapeableQuery};

/// A row the in-memory source can filter, sort and project.
pub trait Record: Clone + Send + Sync {
    /// Value of `name`, `None` when the record has no such field.
    fn field(&self, name: &str) -> Option<FilterValue>;

    /// Copy restricted to `fields`. The default keeps everything.
    #[must_use]
    fn project(&self, fields: &[String]) -> Self {
        let _ = fields;
        self.clone()
    }

    /// Copy without the navigation at the dot-separated `path`. The default
    /// keeps everything.
    #[must_use]
    fn omit(&self, path: &str) -> Self {
        let _ = path;
        self.clone()
    }
}

impl Record for serde_json::Value {
    fn field(&self, name: &str) -> Option<FilterValue> {
        match self.get(name)? {
            serde_json::Value::Null => Some(FilterValue::Null),
            serde_json::Value::Bool(b) => Some(FilterValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                BigDecimal::from_str(&n.to_string()).ok().map(FilterValue::Number)
            }
            serde_json::Value::String(s) => Some(FilterValue::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    fn project(&self, fields: &[String]) -> Self {
        match self {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn omit(&self, path: &str) -> Self {
        let segments: Vec<&str> = path.split('.').collect();
        let mut out = self.clone();
        remove_path(&mut out, &segments);
        out
    }
}

/// Arrays along the way are walked element by element.
fn remove_path(value: &mut serde_json::Value, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                remove_path(item, segments);
            }
        }
        serde_json::Value::Object(map) if rest.is_empty() => {
            map.remove(*first);
        }
        serde_json::Value::Object(map) => {
            if let Some(child) = map.get_mut(*first) {
                remove_path(child, rest);
            }
        }
        _ => {}
    }
}

/// Accumulated shaping steps, evaluated when the query is executed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryQuery {
    filters: Vec<FilterExpr>,
    order: Vec<OrderKey>,
    skip: Option<u64>,
    take: Option<u64>,
    includes: Vec<String>,
    select: Vec<String>,
    fields: Option<BTreeSet<String>>,
    navigations: Option<BTreeSet<String>>,
}

impl MemoryQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constraint owned by the host, applied before any client input.
    #[must_use]
    pub fn with_base_filter(mut self, filter: FilterExpr) -> Self {
        self.filters.push(filter);
        self
    }

    /// Reject filters, ordering and projections on other field names.
    #[must_use]
    pub fn with_known_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Reject include paths not in `paths`.
    #[must_use]
    pub fn with_known_navigations<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.navigations = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn filters(&self) -> &[FilterExpr] {
        &self.filters
    }

    #[must_use]
    pub fn order(&self) -> &[OrderKey] {
        &self.order
    }

    #[must_use]
    pub fn skipped(&self) -> Option<u64> {
        self.skip
    }

    #[must_use]
    pub fn taken(&self) -> Option<u64> {
        self.take
    }

    #[must_use]
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    #[must_use]
    pub fn selected(&self) -> &[String] {
        &self.select
    }

    fn check_field(&self, field: &str) -> Result<(), ShapeError> {
        match &self.fields {
            Some(known) if !known.contains(field) => Err(ShapeError::UnknownField(field.to_owned())),
            _ => Ok(()),
        }
    }

    fn matches<R: Record>(&self, record: &R) -> bool {
        self.filters.iter().all(|f| matches(record, f))
    }

    /// Apply the projection and drop known navigations that were not
    /// included. Included roots survive a projection.
    fn shape<R: Record>(&self, record: &R) -> R {
        let mut out = if self.select.is_empty() {
            record.clone()
        } else {
            let mut keep = self.select.clone();
            for path in &self.includes {
                let root = path.split_once('.').map_or(path.as_str(), |(root, _)| root);
                if !keep.iter().any(|k| k == root) {
                    keep.push(root.to_owned());
                }
            }
            record.project(&keep)
        };
        if let Some(known) = &self.navigations {
            for path in known.iter().filter(|p| !self.includes.contains(*p)) {
                out = out.omit(path);
            }
        }
        out
    }
}

impl ShapeableQuery for MemoryQuery {
    fn and_filter(mut self, filter: &FilterExpr) -> Result<Self, ShapeError> {
        for field in filter.referenced_fields() {
            self.check_field(field)?;
        }
        self.filters.push(filter.clone());
        Ok(self)
    }

    fn order_by(mut self, keys: &[OrderKey]) -> Result<Self, ShapeError> {
        for key in keys {
            self.check_field(&key.field)?;
        }
        self.order.extend_from_slice(keys);
        Ok(self)
    }

    fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    fn take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    fn include(mut self, path: &str) -> Result<Self, ShapeError> {
        if let Some(known) = &self.navigations
            && !known.contains(path)
        {
            return Err(ShapeError::UnknownInclude(path.to_owned()));
        }
        self.includes.push(path.to_owned());
        Ok(self)
    }

    fn select(mut self, fields: &[String]) -> Result<Self, ShapeError> {
        for field in fields {
            self.check_field(field)?;
        }
        self.select = fields.to_vec();
        Ok(self)
    }
}

/// Executes [`MemoryQuery`] over an owned set of records.
#[derive(Debug)]
pub struct MemorySource<T> {
    rows: Vec<T>,
    latency: Option<Duration>,
    failure: Option<(ExecStage, String)>,
    count_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    seen: Mutex<Vec<(ExecStage, MemoryQuery)>>,
}

impl<T: Record> MemorySource<T> {
    #[must_use]
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows,
            latency: None,
            failure: None,
            count_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before answering each call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every call made at `stage`.
    #[must_use]
    pub fn failing_at(mut self, stage: ExecStage, message: impl Into<String>) -> Self {
        self.failure = Some((stage, message.into()));
        self
    }

    #[must_use]
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(AtomicOrdering::SeqCst)
    }

    /// Every query handed to `count` or `fetch`, in call order.
    #[must_use]
    pub fn seen_queries(&self) -> Vec<(ExecStage, MemoryQuery)> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    async fn enter(&self, stage: ExecStage, query: &MemoryQuery) -> Result<(), SourceError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((stage, query.clone()));
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match &self.failure {
            Some((at, message)) if *at == stage => Err(SourceError::with_source(
                format!("in-memory {stage} failed"),
                std::io::Error::other(message.clone()),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<T> QueryExecutor<MemoryQuery> for MemorySource<T>
where
    T: Record + 'static,
{
    type Item = T;

    async fn count(&self, query: &MemoryQuery) -> Result<u64, SourceError> {
        self.count_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter(ExecStage::Count, query).await?;
        let n = self.rows.iter().filter(|r| query.matches(*r)).count();
        Ok(u64::try_from(n).unwrap_or(u64::MAX))
    }

    async fn fetch(&self, query: MemoryQuery) -> Result<Vec<T>, SourceError> {
        self.fetch_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.enter(ExecStage::Fetch, &query).await?;

        let mut rows: Vec<&T> = self.rows.iter().filter(|r| query.matches(*r)).collect();
        if !query.order.is_empty() {
            rows.sort_by(|a, b| compare_records(*a, *b, &query.order));
        }

        let skip = query.skip.map_or(0, to_usize);
        let take = query.take.map_or(usize::MAX, to_usize);
        Ok(rows
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|r| query.shape(r))
            .collect())
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Whether `record` satisfies `expr`. Rows whose result is unknown do not
/// match.
pub fn matches<R: Record + ?Sized>(record: &R, expr: &FilterExpr) -> bool {
    evaluate(record, expr) == Some(true)
}

/// Three-valued evaluation: `None` is SQL's unknown.
fn evaluate<R: Record + ?Sized>(record: &R, expr: &FilterExpr) -> Option<bool> {
    match expr {
        FilterExpr::And(l, r) => match (evaluate(record, l), evaluate(record, r)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        FilterExpr::Or(l, r) => match (evaluate(record, l), evaluate(record, r)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        FilterExpr::Not(inner) => evaluate(record, inner).map(|b| !b),
        FilterExpr::Compare { field, op, value } => {
            let actual = record.field(field).unwrap_or(FilterValue::Null);
            compare_predicate(&actual, *op, value)
        }
        FilterExpr::In { field, values } => {
            let actual = record.field(field).unwrap_or(FilterValue::Null);
            if actual.is_null() {
                return None;
            }
            let mut unknown = false;
            for v in values {
                match compare_predicate(&actual, CompareOp::Eq, v) {
                    Some(true) => return Some(true),
                    Some(false) => {}
                    None => unknown = true,
                }
            }
            if unknown { None } else { Some(false) }
        }
        FilterExpr::Function { func, field, value } => match record.field(field)? {
            FilterValue::String(s) => Some(match func {
                StringFunction::Contains => s.contains(value.as_str()),
                StringFunction::StartsWith => s.starts_with(value.as_str()),
                StringFunction::EndsWith => s.ends_with(value.as_str()),
            }),
            _ => None,
        },
    }
}

/// `eq null` and `ne null` are null tests and always known; any other
/// comparison involving null is unknown.
fn compare_predicate(actual: &FilterValue, op: CompareOp, expected: &FilterValue) -> Option<bool> {
    match (actual.is_null(), expected.is_null()) {
        (a, true) => match op {
            CompareOp::Eq => Some(a),
            CompareOp::Ne => Some(!a),
            _ => None,
        },
        (true, false) => None,
        (false, false) => compare_values(actual, expected).map(|ord| match op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
        }),
    }
}

/// Order two non-null values; `None` when they are not comparable.
///
/// Strings are coerced when compared against typed literals, since JSON
/// carries UUIDs and timestamps as text.
fn compare_values(a: &FilterValue, b: &FilterValue) -> Option<Ordering> {
    use FilterValue as V;
    match (a, b) {
        (V::Bool(a), V::Bool(b)) => Some(a.cmp(b)),
        (V::Number(a), V::Number(b)) => Some(a.cmp(b)),
        (V::String(a), V::String(b)) => Some(a.cmp(b)),
        (V::Uuid(a), V::Uuid(b)) => Some(a.cmp(b)),
        (V::DateTime(a), V::DateTime(b)) => Some(a.cmp(b)),
        (V::Date(a), V::Date(b)) => Some(a.cmp(b)),
        (V::String(s), V::Uuid(u)) => Uuid::parse_str(s).ok().map(|s| s.cmp(u)),
        (V::Uuid(u), V::String(s)) => Uuid::parse_str(s).ok().map(|s| u.cmp(&s)),
        (V::String(s), V::DateTime(dt)) => parse_datetime(s).map(|s| s.cmp(dt)),
        (V::DateTime(dt), V::String(s)) => parse_datetime(s).map(|s| dt.cmp(&s)),
        (V::String(s), V::Date(d)) => NaiveDate::from_str(s).ok().map(|s| s.cmp(d)),
        (V::Date(d), V::String(s)) => NaiveDate::from_str(s).ok().map(|s| d.cmp(&s)),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn compare_records<R: Record>(a: &R, b: &R, keys: &[OrderKey]) -> Ordering {
    for key in keys {
        let ord = compare_nulls_first(a.field(&key.field), b.field(&key.field));
        let ord = match key.dir {
            SortDir::Asc => ord,
            SortDir::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Total order for sorting: nulls first, then values grouped by type, then
/// by value within a type.
fn compare_nulls_first(a: Option<FilterValue>, b: Option<FilterValue>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => type_rank(&a)
            .cmp(&type_rank(&b))
            .then_with(|| compare_values(&a, &b).unwrap_or(Ordering::Equal)),
    }
}

fn type_rank(v: &FilterValue) -> u8 {
    match v {
        FilterValue::Null => 0,
        FilterValue::Bool(_) => 1,
        FilterValue::Number(_) => 2,
        FilterValue::String(_) => 3,
        FilterValue::Uuid(_) => 4,
        FilterValue::DateTime(_) => 5,
        FilterValue::Date(_) => 6,
    }
}
