//! `orgcheck`: operator CLI for the org-audit cache and gateway.
//!
//! Build: `cargo build --bin orgcheck --features cli`

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;

use orgcheck::config::{Config, Secrets};
use orgcheck::connection::HttpConnection;
use orgcheck::{QuietLogger, RateGuard, SoqlRequest};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "orgcheck", about = "inspect an org through the audit gateway")]
struct Args {
    /// path to config.toml
    #[arg(long, env = "ORGCHECK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// persistent cache management
    #[command(subcommand)]
    Cache(CacheCommand),
    /// show daily API usage against the rate guard thresholds
    Limits,
    /// run a SOQL query through the gateway
    Query {
        /// SOQL text
        soql: String,
        /// use the Tooling API
        #[arg(long)]
        tooling: bool,
        /// paginate in windows ordered by this unique field
        #[arg(long)]
        paginate_by: Option<String>,
        /// error codes that yield an empty result instead of failing
        #[arg(long = "bypass")]
        bypass: Vec<String>,
    },
    /// print the build version
    Version,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// list cached entries
    List,
    /// remove one entry
    Remove {
        /// cache key
        key: String,
    },
    /// remove every entry in the namespace
    Clear,
}

// ── Commands ────────────────────────────────────────────────────────

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cache_command(config: &Config, command: CacheCommand) -> CliResult {
    let cache = config.cache.open()?;
    match command {
        CacheCommand::List => print_json(&cache.details()),
        CacheCommand::Remove { key } => {
            cache.remove(&key);
            println!("removed '{key}'.");
            Ok(())
        }
        CacheCommand::Clear => {
            cache.clear();
            println!("cleared namespace '{}'.", cache.config().namespace);
            Ok(())
        }
    }
}

async fn limits(config: &Config) -> CliResult {
    let secrets = Secrets::load()?;
    let instance_url = config
        .salesforce
        .instance_url
        .clone()
        .ok_or("salesforce.instance_url is not set")?;
    let token = secrets
        .access_token()
        .ok_or("no access token configured")?;
    let connection =
        HttpConnection::new(instance_url, config.salesforce.api_version.clone(), token)?;
    let usage = connection.fetch_limits().await?;
    let guard = RateGuard::new(config.rate_guard.clone());
    print_json(&guard.limit_information(&usage))
}

async fn query(
    config: &Config,
    soql: String,
    tooling: bool,
    paginate_by: Option<String>,
    bypass: Vec<String>,
) -> CliResult {
    let secrets = Secrets::load()?;
    let gateway = config.gateway_builder(&secrets)?.build()?;

    let mut request = SoqlRequest::new(soql);
    if tooling {
        request = request.tooling();
    }
    if let Some(field) = paginate_by {
        request = request.paginate_by(field);
    }
    for code in bypass {
        request = request.bypass(code);
    }

    let mut results = gateway.soql_query(&[request], &QuietLogger).await?;
    let records = results.pop().unwrap_or_default();
    eprintln!("{} records", records.len());
    print_json(&records)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let result = match args.command {
        Command::Cache(command) => cache_command(&config, command),
        Command::Limits => limits(&config).await,
        Command::Query {
            soql,
            tooling,
            paginate_by,
            bypass,
        } => query(&config, soql, tooling, paginate_by, bypass).await,
        Command::Version => {
            println!("orgcheck {}", orgcheck::version::version_string());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
