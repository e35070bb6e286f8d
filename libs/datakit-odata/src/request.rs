//! Parsed representation of a client query.
//!
//! A [`QueryRequest`] is built once per inbound call (see
//! [`crate::parse_query_string`]) and is read-only afterwards.

use serde::{Deserialize, Serialize};

use crate::filter::FilterExpr;

/// Sort direction of an `$orderby` term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// One `$orderby` term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub field: String,
    pub dir: SortDir,
}

impl OrderKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Desc,
        }
    }
}

/// Query modifiers attached to an expansion, e.g. `Orders($top=5)`.
///
/// These are captured so they can be reported; they are never applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerOptions {
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub top: Option<String>,
    pub skip: Option<String>,
    pub select: Option<String>,
    pub count: Option<String>,
    pub levels: Option<String>,
}

impl InnerOptions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }

    /// Names of the options that are set, in a stable order.
    pub fn present(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            ("Filter", self.filter.is_some()),
            ("OrderBy", self.order_by.is_some()),
            ("Top", self.top.is_some()),
            ("Skip", self.skip.is_some()),
            ("Select", self.select.is_some()),
            ("Count", self.count.is_some()),
            ("Levels", self.levels.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
    }
}

/// A node of the `$expand` forest.
///
/// Children are owned exclusively; the tree has no shared or cyclic links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandNode {
    pub navigation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<ExpandNode>,
    #[serde(default)]
    pub inner: InnerOptions,
}

impl ExpandNode {
    pub fn new(navigation: impl Into<String>) -> Self {
        Self {
            navigation: navigation.into(),
            nested: Vec::new(),
            inner: InnerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_nested(mut self, child: ExpandNode) -> Self {
        self.nested.push(child);
        self
    }

    #[must_use]
    pub fn with_inner(mut self, inner: InnerOptions) -> Self {
        self.inner = inner;
        self
    }

    /// Depth of the deepest branch below and including this node.
    #[must_use]
    pub fn height(&self) -> usize {
        1 + self.nested.iter().map(ExpandNode::height).max().unwrap_or(0)
    }
}

/// Everything a client asked for, independent of whether it is allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub filter: Option<FilterExpr>,
    #[serde(default)]
    pub order_by: Vec<OrderKey>,
    pub skip: Option<u64>,
    pub top: Option<u64>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub expand: Vec<ExpandNode>,
    #[serde(default)]
    pub count: bool,
}

impl QueryRequest {
    #[must_use]
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_order(mut self, key: OrderKey) -> Self {
        self.order_by.push(key);
        self
    }

    #[must_use]
    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    #[must_use]
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    #[must_use]
    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_expand(mut self, node: ExpandNode) -> Self {
        self.expand.push(node);
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }
}
