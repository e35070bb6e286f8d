//! Wire query string → [`QueryRequest`].
//!
//! Covers the subset of OData system query options the engine understands:
//! `$filter`, `$orderby`, `$top`, `$skip`, `$select`, `$expand`, `$count`.
//! Option names are case-insensitive; parameters without a `$` prefix belong
//! to the hosting application and are ignored.

use std::collections::BTreeSet;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use odata_params::filters::{self as odata, CompareOperator, Expr, Value};
use uuid::Uuid;

use crate::error::ParseError;
use crate::filter::{CompareOp, FilterExpr, FilterValue, StringFunction};
use crate::request::{ExpandNode, InnerOptions, OrderKey, QueryRequest, SortDir};

/// Parse a URL query string (with or without the leading `?`).
///
/// # Errors
/// Returns [`ParseError`] for undecodable input, unknown or repeated `$`
/// options, and malformed option values.
pub fn parse_query_string(query: &str) -> Result<QueryRequest, ParseError> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(query).map_err(|e| ParseError::QueryString(e.to_string()))?;

    let mut seen = BTreeSet::new();
    let mut request = QueryRequest::default();

    for (key, value) in pairs {
        if !key.starts_with('$') {
            continue;
        }
        let option = key.to_ascii_lowercase();
        if !seen.insert(option.clone()) {
            return Err(ParseError::DuplicateOption(key));
        }
        match option.as_str() {
            "$filter" => request.filter = Some(parse_filter(&value)?),
            "$orderby" => request.order_by = parse_order_by(&value)?,
            "$top" => request.top = Some(parse_u64("$top", &value)?),
            "$skip" => request.skip = Some(parse_u64("$skip", &value)?),
            "$count" => request.count = parse_bool("$count", &value)?,
            "$select" => request.select = parse_select(&value)?,
            "$expand" => request.expand = parse_expand(&value)?,
            _ => return Err(ParseError::UnknownOption(key)),
        }
    }

    tracing::trace!(?request, "parsed query string");
    Ok(request)
}

fn parse_u64(option: &'static str, value: &str) -> Result<u64, ParseError> {
    value.trim().parse().map_err(|_| ParseError::InvalidValue {
        option,
        value: value.to_owned(),
    })
}

fn parse_bool(option: &'static str, value: &str) -> Result<bool, ParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ParseError::InvalidValue {
            option,
            value: value.to_owned(),
        }),
    }
}

fn parse_select(value: &str) -> Result<Vec<String>, ParseError> {
    value
        .split(',')
        .map(str::trim)
        .map(|field| {
            if field.is_empty() {
                Err(ParseError::InvalidValue {
                    option: "$select",
                    value: value.to_owned(),
                })
            } else {
                Ok(field.to_owned())
            }
        })
        .collect()
}

/// `col [asc|desc], ...`
fn parse_order_by(value: &str) -> Result<Vec<OrderKey>, ParseError> {
    let mut keys = Vec::new();
    for term in value.split(',') {
        let mut tokens = term.split_whitespace();
        let Some(field) = tokens.next() else {
            return Err(ParseError::OrderBy(term.to_owned()));
        };
        let dir = match tokens.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => SortDir::Asc,
            Some("desc") => SortDir::Desc,
            Some(_) => return Err(ParseError::OrderBy(term.trim().to_owned())),
        };
        if tokens.next().is_some() {
            return Err(ParseError::OrderBy(term.trim().to_owned()));
        }
        keys.push(OrderKey {
            field: field.to_owned(),
            dir,
        });
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// $expand
// ---------------------------------------------------------------------------

fn parse_expand(value: &str) -> Result<Vec<ExpandNode>, ParseError> {
    let mut forest: Vec<ExpandNode> = Vec::new();
    for item in split_top_level(value, ',')? {
        let node = parse_expand_item(item.trim())?;
        merge_node(&mut forest, node);
    }
    Ok(forest)
}

/// `A/B/C(opts)` → `A { B { C(opts) } }`
fn parse_expand_item(item: &str) -> Result<ExpandNode, ParseError> {
    if item.is_empty() {
        return Err(ParseError::Expand("empty expansion item".to_owned()));
    }

    let (path, options) = match item.find('(') {
        Some(open) => {
            let Some(body) = item[open..]
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
            else {
                return Err(ParseError::Expand(format!("unbalanced parentheses in '{item}'")));
            };
            (&item[..open], Some(body))
        }
        None if item.contains(')') => {
            return Err(ParseError::Expand(format!("unbalanced parentheses in '{item}'")));
        }
        None => (item, None),
    };

    let segments: Vec<&str> = path.trim().split('/').map(str::trim).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(ParseError::Expand(format!("invalid navigation path '{path}'")));
    };
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ParseError::Expand(format!("invalid navigation path '{path}'")));
    }

    let mut leaf = ExpandNode::new(*last);
    if let Some(body) = options {
        apply_options(&mut leaf, body)?;
    }

    Ok(parents
        .iter()
        .rev()
        .fold(leaf, |child, parent| ExpandNode::new(*parent).with_nested(child)))
}

fn apply_options(node: &mut ExpandNode, body: &str) -> Result<(), ParseError> {
    let mut inner = InnerOptions::default();
    for part in split_top_level(body, ';')? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            return Err(ParseError::Expand(format!("expected option=value, got '{part}'")));
        };
        let value = value.trim().to_owned();
        match key.trim().to_ascii_lowercase().as_str() {
            "$expand" => {
                for child in parse_expand(&value)? {
                    merge_node(&mut node.nested, child);
                }
            }
            "$filter" => inner.filter = Some(value),
            "$orderby" => inner.order_by = Some(value),
            "$top" => inner.top = Some(value),
            "$skip" => inner.skip = Some(value),
            "$select" => inner.select = Some(value),
            "$count" => inner.count = Some(value),
            "$levels" => inner.levels = Some(value),
            other => {
                return Err(ParseError::Expand(format!("unknown nested option '{other}'")));
            }
        }
    }
    node.inner = inner;
    Ok(())
}

/// Fold `A/B,A/C` into a single `A` with two children.
fn merge_node(forest: &mut Vec<ExpandNode>, node: ExpandNode) {
    let existing = forest
        .iter_mut()
        .find(|n| n.navigation == node.navigation && n.inner.is_empty() && node.inner.is_empty());
    match existing {
        Some(target) => {
            for child in node.nested {
                merge_node(&mut target.nested, child);
            }
        }
        None => forest.push(node),
    }
}

/// Split on `sep` outside parentheses and single-quoted literals.
fn split_top_level(input: &str, sep: char) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ParseError::Expand(format!("unbalanced parentheses in '{input}'"))
                })?;
            }
            c if c == sep && depth == 0 && !quoted => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::Expand(format!("unbalanced parentheses in '{input}'")));
    }
    if quoted {
        return Err(ParseError::Expand(format!("unterminated string in '{input}'")));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

// ---------------------------------------------------------------------------
// $filter
// ---------------------------------------------------------------------------

fn parse_filter(value: &str) -> Result<FilterExpr, ParseError> {
    let expr = odata::parse_str(value).map_err(|e| ParseError::Filter(format!("{e:?}")))?;
    lower(expr)
}

fn lower(expr: Expr) -> Result<FilterExpr, ParseError> {
    match expr {
        Expr::And(l, r) => Ok(lower(*l)?.and(lower(*r)?)),
        Expr::Or(l, r) => Ok(lower(*l)?.or(lower(*r)?)),
        Expr::Not(inner) => Ok(lower(*inner)?.not()),
        Expr::Compare(l, op, r) => lower_compare(*l, op, *r),
        Expr::In(l, values) => {
            let field = identifier(*l)?;
            let values = values
                .into_iter()
                .map(|v| match v {
                    Expr::Value(v) => literal(v),
                    other => Err(unsupported(&other)),
                })
                .collect::<Result<_, _>>()?;
            Ok(FilterExpr::In { field, values })
        }
        Expr::Function(name, args) => lower_function(&name, args),
        // A bare boolean property.
        Expr::Identifier(field) => Ok(FilterExpr::eq(field, true)),
        other => Err(unsupported(&other)),
    }
}

fn lower_compare(l: Expr, op: CompareOperator, r: Expr) -> Result<FilterExpr, ParseError> {
    let op = compare_op(&op);
    match (l, r) {
        (Expr::Identifier(field), Expr::Value(v)) => Ok(FilterExpr::Compare {
            field,
            op,
            value: literal(v)?,
        }),
        (Expr::Value(v), Expr::Identifier(field)) => Ok(FilterExpr::Compare {
            field,
            op: flip(op),
            value: literal(v)?,
        }),
        (l, _) => Err(ParseError::UnsupportedFilter(format!(
            "comparison must be between a field and a literal near {l:?}"
        ))),
    }
}

fn lower_function(name: &str, args: Vec<Expr>) -> Result<FilterExpr, ParseError> {
    let Some(func) = StringFunction::from_name(name) else {
        return Err(ParseError::UnsupportedFilter(format!("function '{name}'")));
    };
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(Expr::Identifier(field)), Some(Expr::Value(Value::String(value))), None) => {
            Ok(FilterExpr::Function { func, field, value })
        }
        _ => Err(ParseError::UnsupportedFilter(format!(
            "{name} expects (field, 'text')"
        ))),
    }
}

fn identifier(expr: Expr) -> Result<String, ParseError> {
    match expr {
        Expr::Identifier(field) => Ok(field),
        other => Err(ParseError::UnsupportedFilter(format!(
            "expected a field name, got {other:?}"
        ))),
    }
}

fn compare_op(op: &CompareOperator) -> CompareOp {
    match op {
        CompareOperator::Equal => CompareOp::Eq,
        CompareOperator::NotEqual => CompareOp::Ne,
        CompareOperator::GreaterThan => CompareOp::Gt,
        CompareOperator::GreaterOrEqual => CompareOp::Ge,
        CompareOperator::LessThan => CompareOp::Lt,
        CompareOperator::LessOrEqual => CompareOp::Le,
    }
}

/// `5 lt x` is `x gt 5`
fn flip(op: CompareOp) -> CompareOp {
    match op {
        CompareOp::Gt => CompareOp::Lt,
        CompareOp::Ge => CompareOp::Le,
        CompareOp::Lt => CompareOp::Gt,
        CompareOp::Le => CompareOp::Ge,
        same @ (CompareOp::Eq | CompareOp::Ne) => same,
    }
}

// Literals go through their text form so the parser's own numeric and
// temporal types never leak into the request model.
fn literal(value: Value) -> Result<FilterValue, ParseError> {
    let bad = |what: &str, text: &str| ParseError::Filter(format!("invalid {what} literal '{text}'"));
    match value {
        Value::Null => Ok(FilterValue::Null),
        Value::Bool(b) => Ok(FilterValue::Bool(b)),
        Value::String(s) => Ok(FilterValue::String(s)),
        Value::Number(n) => {
            let text = n.to_string();
            BigDecimal::from_str(&text)
                .map(FilterValue::Number)
                .map_err(|_| bad("number", &text))
        }
        Value::Uuid(u) => {
            let text = u.to_string();
            Uuid::parse_str(&text)
                .map(FilterValue::Uuid)
                .map_err(|_| bad("uuid", &text))
        }
        Value::DateTime(dt) => {
            let text = dt.to_rfc3339();
            DateTime::parse_from_rfc3339(&text)
                .map(|dt| FilterValue::DateTime(dt.with_timezone(&Utc)))
                .map_err(|_| bad("datetime", &text))
        }
        Value::Date(d) => {
            let text = d.to_string();
            NaiveDate::from_str(&text)
                .map(FilterValue::Date)
                .map_err(|_| bad("date", &text))
        }
        other => Err(ParseError::UnsupportedFilter(format!("literal {other:?}"))),
    }
}

fn unsupported(expr: &Expr) -> ParseError {
    ParseError::UnsupportedFilter(format!("{expr:?}"))
}
