use std::path::Path;

use anyhow::{Context, Result, bail};
use datakit_odata::memory::{MemoryQuery, MemorySource};
use datakit_odata::{
    PipelineSteps, QueryError, QueryPipeline, QueryPolicy, QueryValidator, ResultEnvelope,
    load_policy, parse_query_string, policy_figment,
};
use serde::Serialize;
use serde_json::Value;

pub const EXIT_OK: u8 = 0;
pub const EXIT_USAGE: u8 = 1;
pub const EXIT_REJECTED: u8 = 2;
pub const EXIT_FAILED: u8 = 3;

/// What to print on stdout and how to exit.
#[derive(Debug)]
pub struct Output {
    pub code: u8,
    pub body: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationOutput<'a> {
    accepted: bool,
    report: &'a [String],
    violations: Vec<ViolationOutput>,
    includes: Vec<&'a str>,
}

#[derive(Serialize)]
struct ViolationOutput {
    code: String,
    option: &'static str,
    message: String,
}

fn load(path: Option<&Path>) -> Result<QueryPolicy> {
    if let Some(p) = path
        && !p.is_file()
    {
        bail!("policy file {} does not exist", p.display());
    }
    let policy = load_policy(&policy_figment(path)).context("invalid policy")?;
    tracing::debug!(?policy, "policy loaded");
    Ok(policy)
}

pub fn validate(policy: Option<&Path>, query: &str) -> Result<Output> {
    let policy = load(policy)?;
    let request = parse_query_string(query).context("malformed query string")?;

    let (code, body) = match QueryValidator::new(&policy).validate(request) {
        Ok(validated) => {
            let out = ValidationOutput {
                accepted: true,
                report: validated.report().codes(),
                violations: Vec::new(),
                includes: validated.includes().iter().collect(),
            };
            (EXIT_OK, serde_json::to_string_pretty(&out)?)
        }
        Err(rejected) => {
            let out = ValidationOutput {
                accepted: false,
                report: rejected.report.codes(),
                violations: rejected
                    .violations
                    .iter()
                    .map(|v| ViolationOutput {
                        code: v.code(),
                        option: v.option(),
                        message: v.to_string(),
                    })
                    .collect(),
                includes: Vec::new(),
            };
            (EXIT_REJECTED, serde_json::to_string_pretty(&out)?)
        }
    };
    Ok(Output { code, body })
}

pub async fn run(policy: Option<&Path>, query: &str, data: &Path, no_count: bool) -> Result<Output> {
    let policy = load(policy)?;
    let raw = std::fs::read_to_string(data)
        .with_context(|| format!("reading {}", data.display()))?;
    let rows: Vec<Value> =
        serde_json::from_str(&raw).context("data file must hold a JSON array")?;
    let source = MemorySource::new(rows);

    let mut pipeline = QueryPipeline::new(&policy);
    if no_count {
        pipeline = pipeline.with_steps(PipelineSteps::without_count());
    }

    let result = match parse_query_string(query) {
        Ok(request) => pipeline.execute(MemoryQuery::new(), &source, request).await,
        Err(e) => Err(QueryError::from(e)),
    };

    let (code, envelope) = match result {
        Ok(envelope) => (EXIT_OK, envelope),
        Err(err) => {
            tracing::warn!(error = %err, "query failed");
            let code = if err.is_client_error() {
                EXIT_REJECTED
            } else {
                EXIT_FAILED
            };
            (code, ResultEnvelope::<Value>::from_error(&err))
        }
    };
    Ok(Output {
        code,
        body: serde_json::to_string_pretty(&envelope)?,
    })
}
