//! Policy configuration as it appears in YAML files and the environment.
//!
//! ```yaml
//! max_top: 100
//! server_page_size: 25
//! allow_order_by: true
//! allowed_order_by: [name, created_at]
//! allow_expand: true
//! allowed_expand: [Orders]
//! ```
//!
//! Every key can be overridden with a `DATAKIT_POLICY__<KEY>` variable, e.g.
//! `DATAKIT_POLICY__MAX_TOP=50`.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::policy::{DEFAULT_MAX_EXPANSION_DEPTH, PolicyConfigError, QueryPolicy};

/// Environment prefix for policy overrides.
pub const ENV_PREFIX: &str = "DATAKIT_POLICY__";

/// Raw policy settings. Limits stay signed until [`QueryPolicy`] checks them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct QueryPolicyConfig {
    #[serde(default)]
    pub max_top: Option<i64>,
    #[serde(default)]
    pub server_page_size: Option<i64>,
    #[serde(default = "default_true")]
    pub allow_filter: bool,
    #[serde(default)]
    pub allow_order_by: bool,
    #[serde(default)]
    pub allowed_order_by: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_select: bool,
    #[serde(default)]
    pub allow_expand: bool,
    #[serde(default)]
    pub allowed_expand: Vec<String>,
    #[serde(default = "default_max_expansion_depth")]
    pub max_expansion_depth: i64,
    #[serde(default = "default_true")]
    pub allow_count: bool,
}

impl Default for QueryPolicyConfig {
    fn default() -> Self {
        Self {
            max_top: None,
            server_page_size: None,
            allow_filter: true,
            allow_order_by: false,
            allowed_order_by: Vec::new(),
            allow_select: true,
            allow_expand: false,
            allowed_expand: Vec::new(),
            max_expansion_depth: default_max_expansion_depth(),
            allow_count: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_expansion_depth() -> i64 {
    i64::from(DEFAULT_MAX_EXPANSION_DEPTH)
}

impl TryFrom<QueryPolicyConfig> for QueryPolicy {
    type Error = PolicyConfigError;

    fn try_from(cfg: QueryPolicyConfig) -> Result<Self, Self::Error> {
        let mut builder = QueryPolicy::builder()
            .allow_filter(cfg.allow_filter)
            .allow_order_by(cfg.allow_order_by)
            .allowed_order_by(cfg.allowed_order_by)
            .allow_select(cfg.allow_select)
            .allow_expand(cfg.allow_expand)
            .allowed_expand(cfg.allowed_expand)
            .max_expansion_depth(cfg.max_expansion_depth)
            .allow_count(cfg.allow_count);
        if let Some(max_top) = cfg.max_top {
            builder = builder.max_top(max_top);
        }
        if let Some(size) = cfg.server_page_size {
            builder = builder.server_page_size(size);
        }
        builder.build()
    }
}

/// Layered sources: built-in defaults, then `path` (if any), then the
/// environment.
#[must_use]
pub fn policy_figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(QueryPolicyConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Yaml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX))
}

/// Extract and check a policy.
///
/// # Errors
/// Returns [`PolicyConfigError::Source`] when the sources cannot be read or
/// contain unknown keys, and the builder's errors for out-of-range values.
pub fn load_policy(figment: &Figment) -> Result<QueryPolicy, PolicyConfigError> {
    let cfg: QueryPolicyConfig = figment
        .extract()
        .map_err(|e| PolicyConfigError::Source(e.to_string()))?;
    tracing::debug!(?cfg, "loaded query policy configuration");
    QueryPolicy::try_from(cfg)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::Jail;

    fn from_yaml(yaml: &str) -> Result<QueryPolicy, PolicyConfigError> {
        let figment = Figment::from(Serialized::defaults(QueryPolicyConfig::default()))
            .merge(Yaml::string(yaml));
        load_policy(&figment)
    }

    #[test]
    fn empty_document_yields_default_policy() {
        let policy = from_yaml("").unwrap();
        assert_eq!(policy, QueryPolicy::default());
    }

    #[test]
    fn yaml_overrides_are_applied() {
        let policy = from_yaml(
            r"
max_top: 100
server_page_size: 25
allow_order_by: true
allowed_order_by: [name, created_at]
allow_expand: true
allowed_expand: [Orders]
max_expansion_depth: 3
",
        )
        .unwrap();

        assert_eq!(policy.max_top(), Some(100));
        assert_eq!(policy.server_page_size(), Some(25));
        assert!(policy.allow_order_by());
        assert!(policy.order_column_allowed("created_at"));
        assert!(!policy.order_column_allowed("salary"));
        assert!(policy.expand_path_allowed("Orders"));
        assert_eq!(policy.max_expansion_depth(), 3);
    }

    #[test]
    fn negative_limit_fails_at_load() {
        let err = from_yaml("max_top: -1").unwrap_err();
        assert_eq!(
            err,
            PolicyConfigError::Negative {
                field: "max_top",
                value: -1
            }
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = from_yaml("max_tpo: 10").unwrap_err();
        assert!(matches!(err, PolicyConfigError::Source(msg) if msg.contains("max_tpo")));
    }

    #[test]
    fn environment_overrides_the_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "policy.yaml",
                "max_top: 100\nallow_expand: true\nallowed_expand: [Orders]\n",
            )?;
            jail.set_env("DATAKIT_POLICY__MAX_TOP", "50");
            jail.set_env("DATAKIT_POLICY__ALLOW_COUNT", "false");

            let policy = load_policy(&policy_figment(Some(Path::new("policy.yaml")))).unwrap();

            assert_eq!(policy.max_top(), Some(50));
            assert!(!policy.allow_count());
            assert!(policy.allow_expand());
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_| {
            let policy = load_policy(&policy_figment(Some(Path::new("absent.yaml")))).unwrap();
            assert_eq!(policy, QueryPolicy::default());
            Ok(())
        });
    }
}
