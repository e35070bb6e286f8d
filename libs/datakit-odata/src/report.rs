//! Diagnostic codes collected while validating a request.

use std::fmt;

use serde::Serialize;

pub const EXPAND_IGNORED_MAX_DEPTH: &str = "ExpandIgnored.MaxDepth";
pub const EXPAND_IGNORED_NOT_ALLOWED: &str = "ExpandIgnored.NotAllowed";
pub const EXPAND_IGNORED_INNER_OPTIONS: &str = "ExpandIgnored.InnerOptions";

/// Ordered, append-only list of diagnostic codes.
///
/// The report is meant for logs and telemetry. Program logic must branch on
/// [`crate::Violation`]s, not on report contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationReport {
    codes: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: impl Into<String>) {
        self.codes.push(code.into());
    }

    /// Append `<code>:<detail>`, e.g. `ExpandInnerFilterIgnored:Orders`.
    pub fn push_with(&mut self, code: &str, detail: &str) {
        self.codes.push(format!("{code}:{detail}"));
    }

    #[must_use]
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.codes.iter().any(|c| c == code)
    }

    /// Number of entries equal to `code`.
    #[must_use]
    pub fn count_of(&self, code: &str) -> usize {
        self.codes.iter().filter(|c| *c == code).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.codes.join(", "))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_duplicates() {
        let mut report = ValidationReport::new();
        report.push(EXPAND_IGNORED_MAX_DEPTH);
        report.push_with("ExpandInnerFilterIgnored", "Orders");
        report.push(EXPAND_IGNORED_MAX_DEPTH);

        assert_eq!(report.len(), 3);
        assert_eq!(report.count_of(EXPAND_IGNORED_MAX_DEPTH), 2);
        assert!(report.contains("ExpandInnerFilterIgnored:Orders"));
        assert_eq!(
            report.to_string(),
            "ExpandIgnored.MaxDepth, ExpandInnerFilterIgnored:Orders, ExpandIgnored.MaxDepth"
        );
    }

    #[test]
    fn serializes_as_plain_list() {
        let mut report = ValidationReport::new();
        report.push("Top.ExceedsMax");
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"["Top.ExceedsMax"]"#);
    }
}
