//! `$expand` tree walker.
//!
//! Descends the requested relation-inclusion forest depth-first and keeps
//! only the branches the policy allows. Every dropped branch leaves a code in
//! the [`ValidationReport`]; the walker itself never fails a request.
//!
//! Rules per node, in order:
//!
//! 1. `depth >= max_expansion_depth` drops the node and its subtree.
//! 2. Any nested query option (`$filter`, `$orderby`, `$top`, `$skip`,
//!    `$select`, `$count`, `$levels`) drops the whole subtree. Nested
//!    `$expand` on its own is fine.
//! 3. A non-empty allow-list must contain the root segment or the full path.
//!
//! Siblings are always visited independently of each other.

use serde::Serialize;

use crate::policy::QueryPolicy;
use crate::report::{
    EXPAND_IGNORED_INNER_OPTIONS, EXPAND_IGNORED_MAX_DEPTH, EXPAND_IGNORED_NOT_ALLOWED,
    ValidationReport,
};
use crate::request::ExpandNode;

/// Validated inclusion paths, dot-joined, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct IncludeSet {
    paths: Vec<String>,
}

impl IncludeSet {
    fn insert(&mut self, path: String) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

/// Result of walking one `$expand` forest.
#[derive(Debug, Clone, Default)]
pub struct ExpandOutcome {
    pub paths: IncludeSet,
    /// Top-level branches in the request.
    pub requested: usize,
    /// Nodes dropped anywhere in the forest.
    pub rejected: usize,
    pub report: ValidationReport,
}

impl ExpandOutcome {
    /// An expansion was requested but nothing survived.
    #[must_use]
    pub fn all_rejected(&self) -> bool {
        self.requested > 0 && self.paths.is_empty()
    }
}

/// Walks `$expand` forests against a policy.
#[derive(Debug, Clone, Copy)]
pub struct ExpansionWalker<'p> {
    policy: &'p QueryPolicy,
}

impl<'p> ExpansionWalker<'p> {
    #[must_use]
    pub fn new(policy: &'p QueryPolicy) -> Self {
        Self { policy }
    }

    /// Walk the forest and collect the paths that may be included.
    ///
    /// When the policy disables expansion the result is empty and nothing is
    /// visited; reporting that case is up to the caller.
    #[must_use]
    pub fn walk(&self, forest: &[ExpandNode]) -> ExpandOutcome {
        let mut out = ExpandOutcome {
            requested: forest.len(),
            ..ExpandOutcome::default()
        };

        if forest.is_empty() || !self.policy.allow_expand() {
            return out;
        }

        for node in forest {
            self.visit(node, None, 0, &mut out);
        }
        out
    }

    fn visit(&self, node: &ExpandNode, parent: Option<&str>, depth: u32, out: &mut ExpandOutcome) {
        let path = match parent {
            Some(p) => format!("{p}.{}", node.navigation),
            None => node.navigation.clone(),
        };

        if depth >= self.policy.max_expansion_depth() {
            tracing::debug!(path = %path, depth, "expand branch beyond max depth");
            out.report.push(EXPAND_IGNORED_MAX_DEPTH);
            out.rejected += 1;
            return;
        }

        if !node.inner.is_empty() {
            tracing::debug!(path = %path, "expand branch carries nested query options");
            for option in node.inner.present() {
                out.report
                    .push_with(&format!("ExpandInner{option}Ignored"), &path);
            }
            out.report.push(EXPAND_IGNORED_INNER_OPTIONS);
            out.rejected += 1;
            return;
        }

        if !self.policy.expand_path_allowed(&path) {
            tracing::debug!(path = %path, "expand path not in allow-list");
            out.report.push(EXPAND_IGNORED_NOT_ALLOWED);
            out.rejected += 1;
            return;
        }

        out.paths.insert(path.clone());

        for child in &node.nested {
            self.visit(child, Some(&path), depth + 1, out);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::request::InnerOptions;

    fn policy(allowed: &[&str], depth: i64) -> QueryPolicy {
        QueryPolicy::builder()
            .allow_expand(true)
            .allowed_expand(allowed.iter().copied())
            .max_expansion_depth(depth)
            .build()
            .unwrap()
    }

    fn paths(outcome: &ExpandOutcome) -> Vec<&str> {
        outcome.paths.iter().collect()
    }

    #[test]
    fn nested_chain_within_depth_is_accepted() {
        let policy = policy(&["Orders"], 2);
        let forest = [ExpandNode::new("Orders").with_nested(ExpandNode::new("Lines"))];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Orders", "Orders.Lines"]);
        assert!(outcome.report.is_empty());
        assert_eq!(outcome.rejected, 0);
    }

    #[test]
    fn branches_at_max_depth_are_dropped_but_siblings_survive() {
        let policy = policy(&[], 2);
        let forest = [
            ExpandNode::new("Orders").with_nested(
                ExpandNode::new("Lines").with_nested(ExpandNode::new("Product")),
            ),
            ExpandNode::new("Customer"),
        ];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Orders", "Orders.Lines", "Customer"]);
        assert_eq!(outcome.report.codes(), [EXPAND_IGNORED_MAX_DEPTH]);
        assert!(!outcome.all_rejected());
    }

    #[test]
    fn zero_depth_rejects_everything() {
        let policy = policy(&[], 0);
        let forest = [ExpandNode::new("Orders"), ExpandNode::new("Customer")];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert!(outcome.all_rejected());
        assert_eq!(outcome.report.count_of(EXPAND_IGNORED_MAX_DEPTH), 2);
    }

    #[test]
    fn inner_options_drop_the_whole_subtree() {
        let policy = policy(&[], 3);
        let inner = InnerOptions {
            filter: Some("Qty gt 1".to_owned()),
            top: Some("5".to_owned()),
            ..Default::default()
        };
        let forest = [
            ExpandNode::new("Orders")
                .with_inner(inner)
                .with_nested(ExpandNode::new("Lines")),
            ExpandNode::new("Customer"),
        ];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Customer"]);
        assert_eq!(
            outcome.report.codes(),
            [
                "ExpandInnerFilterIgnored:Orders",
                "ExpandInnerTopIgnored:Orders",
                EXPAND_IGNORED_INNER_OPTIONS,
            ]
        );
    }

    #[test]
    fn nested_inner_options_keep_the_parent() {
        let policy = policy(&[], 3);
        let inner = InnerOptions {
            select: Some("Qty".to_owned()),
            ..Default::default()
        };
        let forest = [ExpandNode::new("Orders").with_nested(ExpandNode::new("Lines").with_inner(inner))];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Orders"]);
        assert!(outcome.report.contains("ExpandInnerSelectIgnored:Orders.Lines"));
    }

    #[test]
    fn paths_outside_the_allow_list_are_dropped() {
        let policy = policy(&["Orders"], 2);
        let forest = [ExpandNode::new("Invoices"), ExpandNode::new("Orders")];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Orders"]);
        assert_eq!(outcome.report.codes(), [EXPAND_IGNORED_NOT_ALLOWED]);
    }

    #[test]
    fn full_path_entry_does_not_admit_its_parent() {
        let policy = policy(&["Customer.Address"], 3);
        let forest = [ExpandNode::new("Customer").with_nested(ExpandNode::new("Address"))];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        // The root segment itself is not listed, so its branch never reaches the child.
        assert!(outcome.all_rejected());
        assert_eq!(outcome.report.codes(), [EXPAND_IGNORED_NOT_ALLOWED]);
    }

    #[test]
    fn disabled_expand_yields_nothing_without_reporting() {
        let policy = QueryPolicy::default();
        let forest = [ExpandNode::new("Orders")];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert!(outcome.paths.is_empty());
        assert!(outcome.report.is_empty());
        assert!(outcome.all_rejected());
    }

    #[test]
    fn duplicate_paths_are_collapsed() {
        let policy = policy(&[], 2);
        let forest = [ExpandNode::new("Orders"), ExpandNode::new("Orders")];

        let outcome = ExpansionWalker::new(&policy).walk(&forest);

        assert_eq!(paths(&outcome), ["Orders"]);
    }
}
