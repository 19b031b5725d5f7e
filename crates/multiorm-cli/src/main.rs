//! MultiORM Command-Line Client
//!
//! Runs queries through the router against the adapters named in a config
//! file, or against ephemeral instances of all three when none is given.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod executor;
mod formatter;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use multiorm_core::{AdaptersConfig, MultiOrmConfig, QueryRouter};
use multiorm_proto::{DatabaseQuery, IsolationLevel, TransactionOptions};

/// MultiORM Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "multiorm")]
#[command(version, about = "Route queries across SQLite, sled and in-memory backends")]
pub struct Args {
    /// JSON configuration file (defaults to ephemeral adapters)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Seed every connected adapter from a JSON file before running
    #[arg(long, global = true)]
    pub seed: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    /// Print performance metrics after the command
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Print metrics in Prometheus text format instead
    #[arg(long, global = true)]
    pub prometheus: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute queries one at a time
    Query {
        /// Inline JSON query (read from --file or stdin when absent)
        query: Option<String>,
        /// Read queries from a file, one per line or a JSON array
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Execute queries atomically on one provider
    Transaction {
        /// Inline JSON array of queries
        queries: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// read_uncommitted, read_committed, repeatable_read or serializable
        #[arg(long)]
        isolation: Option<String>,
        /// Deadline for the whole transaction in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show which provider each query would be routed to
    Route {
        query: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Score queries and suggest indexes
    Analyze {
        query: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("multiorm=info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `false` when some queries failed but the run itself completed.
async fn run(args: Args) -> Result<bool> {
    let config = load_config(args.config.as_deref())?;
    let router = QueryRouter::from_config(&config)?;

    for (provider, err) in router.connect_all().await {
        tracing::warn!(%provider, error = %err, "adapter failed to connect");
    }

    if let Some(path) = &args.seed {
        let text = read_file(path)?;
        let tables = executor::parse_seed(&text)?;
        let inserted = executor::seed(&router, &tables).await?;
        tracing::info!(rows = inserted, "seed complete");
    }

    let formatter = formatter::create_formatter(args.format);
    let outcome = execute(&router, args.command, &*formatter).await;

    if args.prometheus {
        print!("{}", router.tracker().to_prometheus());
    } else if args.metrics {
        println!("{}", formatter.format_metrics(&router.metrics()));
    }

    router.disconnect_all().await;
    outcome
}

async fn execute(
    router: &QueryRouter,
    command: Command,
    formatter: &dyn formatter::Formatter,
) -> Result<bool> {
    match command {
        Command::Query { query, file } => {
            let queries = load_queries(query, file)?;
            let (outputs, failures) = executor::run_queries(router, &queries, formatter).await;
            for output in outputs {
                println!("{}", output);
            }
            Ok(failures == 0)
        }
        Command::Transaction {
            queries,
            file,
            isolation,
            timeout,
        } => {
            let queries = load_queries(queries, file)?;
            let options = TransactionOptions {
                isolation_level: isolation.as_deref().map(parse_isolation).transpose()?,
                timeout_ms: timeout,
                ..TransactionOptions::default()
            };
            let output = executor::run_transaction(router, &queries, &options, formatter).await?;
            println!("{}", output);
            Ok(true)
        }
        Command::Route { query, file } => {
            for query in load_queries(query, file)? {
                println!("{}", formatter.format_selection(&router.select(&query)));
            }
            Ok(true)
        }
        Command::Analyze { query, file } => {
            for query in load_queries(query, file)? {
                println!("{}", formatter.format_analysis(&router.analyze(&query)));
            }
            Ok(true)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<MultiOrmConfig> {
    match path {
        Some(path) => MultiOrmConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(MultiOrmConfig {
            adapters: AdaptersConfig::ephemeral(),
            ..MultiOrmConfig::default()
        }),
    }
}

fn load_queries(inline: Option<String>, file: Option<PathBuf>) -> Result<Vec<DatabaseQuery>> {
    let text = match (inline, file) {
        (Some(_), Some(_)) => bail!("pass either an inline query or --file, not both"),
        (Some(text), None) => text,
        (None, Some(path)) => read_file(&path)?,
        (None, None) => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading queries from stdin")?;
            text
        }
    };

    let queries = executor::parse_queries(&text)?;
    if queries.is_empty() {
        bail!("no queries given");
    }
    Ok(queries)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn parse_isolation(name: &str) -> Result<IsolationLevel> {
    serde_json::from_value(serde_json::Value::String(name.to_ascii_lowercase()))
        .with_context(|| format!("unknown isolation level `{}`", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            parse_isolation("Serializable").unwrap(),
            IsolationLevel::Serializable
        );
        assert_eq!(
            parse_isolation("read_committed").unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert!(parse_isolation("snapshot").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = load_config(None).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_queries_rejects_both_sources() {
        let err = load_queries(Some("{}".into()), Some(PathBuf::from("q.json"))).unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_load_queries_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.jsonl");
        std::fs::write(
            &path,
            "{\"type\": \"select\", \"table\": \"a\"}\n{\"type\": \"select\", \"table\": \"b\"}\n",
        )
        .unwrap();
        let queries = load_queries(None, Some(path)).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].table(), Some("b"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "multiorm",
            "--format",
            "json",
            "route",
            r#"{"type": "raw", "sql": "SELECT 1"}"#,
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        assert!(matches!(args.command, Command::Route { query: Some(_), .. }));
    }
}
