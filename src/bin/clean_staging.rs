use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use staging_cleanup::tracing::{init_tracing, DEFAULT_FILTER};
use staging_cleanup::util::env;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "clean_staging", version, about = "Clean staged provider records before promotion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Probe TLS support, then rewrite URLs and tags of temp_import_<table> in place
    Clean {
        /// Media table whose staging copy is cleaned (e.g. image)
        #[arg(long, default_value = "image")]
        table: String,
        /// Optional override for the upstream catalog URL (defaults to env)
        #[arg(long)]
        upstream_url: Option<String>,
    },
    /// Print the per-provider TLS decision without touching any row
    ProbeTls {
        #[arg(long, default_value = "image")]
        table: String,
        #[arg(long)]
        upstream_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER)?;
    env::bootstrap_cli("clean_staging");
    env::preflight_check(
        "clean_staging",
        &[],
        &[
            "STAGING_DATABASE_URL",
            "DATABASE_URL",
            "UPSTREAM_DATABASE_URL",
            "CLEANUP_WORKERS",
            "CLEANUP_BATCH_SIZE",
            "TLS_PROBE_SAMPLE_SIZE",
            "TLS_PROBE_TIMEOUT_SECS",
        ],
    )?;

    match Cli::parse().command {
        Commands::Clean {
            table,
            upstream_url,
        } => {
            let upstream = resolve_upstream(upstream_url)?;
            staging_cleanup::clean_table(&table, &upstream)
                .await
                .with_context(|| format!("cleanup of table {table} failed"))?;
            info!(table = %table, "cleanup complete");
        }
        Commands::ProbeTls {
            table,
            upstream_url,
        } => {
            let upstream = resolve_upstream(upstream_url)?;
            let support = staging_cleanup::decide_provider_tls(&table, &upstream).await?;
            let mut decisions: Vec<(&str, bool)> = support.iter().collect();
            decisions.sort_unstable();
            for (provider, prefer_https) in decisions {
                println!("{provider}\t{}", if prefer_https { "https" } else { "http" });
            }
        }
    }
    Ok(())
}

fn resolve_upstream(flag: Option<String>) -> Result<String> {
    match flag {
        Some(url) => Ok(url),
        None => env::upstream_db_url(),
    }
}
