use std::path::PathBuf;

use agora_recon::{run_reconcile, ReconcileConfig, RunMode};
use agora_store::SqliteStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agora")]
#[command(about = "Agora city event listing maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deduplicate the upcoming-event working set.
    Reconcile {
        /// Compute and report only; delete nothing.
        #[arg(long)]
        dry_run: bool,
        /// SQLite connection string, e.g. sqlite://data/events.db
        #[arg(long)]
        database_url: Option<String>,
        /// Reconciliation rules file (trust tiers, threshold, festival markers).
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn env_database_url() -> String {
    std::env::var("AGORA_DATABASE_URL").unwrap_or_else(|_| "sqlite://data/events.db".to_string())
}

fn env_rules_path() -> Option<PathBuf> {
    std::env::var("AGORA_RULES_PATH").ok().map(PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Reconcile {
            dry_run,
            database_url,
            rules,
        } => {
            let database_url = database_url.unwrap_or_else(env_database_url);
            let config = match rules.or_else(env_rules_path) {
                Some(path) => ReconcileConfig::from_yaml_file(&path)?,
                None => ReconcileConfig::default(),
            };
            let store = SqliteStore::connect(&database_url)
                .await
                .with_context(|| format!("connecting to {database_url}"))?;

            let mode = if dry_run { RunMode::DryRun } else { RunMode::Apply };
            let now = chrono::Local::now().naive_local();
            let report = run_reconcile(&store, &config, mode, now).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            eprintln!(
                "reconcile complete: removed {} of {} ({:.1}%), {} protected, {} surviving{}",
                report.total_removed,
                report.initial_count,
                report.removal_rate * 100.0,
                report.protected.total,
                report.surviving_count,
                if report.within_threshold { "" } else { " [over threshold, review]" },
            );
        }
    }

    Ok(())
}
