//! Datakit CLI: check and run structured queries against a policy.
//!
//! - `validate`: report whether a query string is accepted by a policy.
//! - `run`: execute a query string over a JSON array and print the result
//!   envelope.
//!
//! Policies are YAML files; every key can be overridden through
//! `DATAKIT_POLICY__<KEY>` environment variables.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "datakit")]
#[command(about = "Validate and run policy-guarded queries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Policy file (YAML). Defaults apply when omitted.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a query string against the policy
    Validate {
        /// Query string, e.g. `$filter=age gt 30&$top=10`
        #[arg(long)]
        query: String,
    },
    /// Run a query string over a JSON array of objects
    Run {
        #[arg(long)]
        query: String,
        /// File holding a JSON array
        #[arg(long)]
        data: PathBuf,
        /// Skip the count query; the envelope carries no total
        #[arg(long, default_value_t = false)]
        no_count: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Validate { query } => commands::validate(cli.policy.as_deref(), &query),
        Commands::Run {
            query,
            data,
            no_count,
        } => commands::run(cli.policy.as_deref(), &query, &data, no_count).await,
    };

    match outcome {
        Ok(out) => {
            println!("{}", out.body);
            ExitCode::from(out.code)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::EXIT_USAGE)
        }
    }
}
