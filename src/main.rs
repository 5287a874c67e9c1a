//! CLI entry point for the manual harvester.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::{LocalPersistence, Pipeline, PipelineSettings, RetryPolicy};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!(configs = %args.configs.display(), dry_run = args.dry_run, "harvester starting");

    let settings = PipelineSettings {
        download_concurrency: usize::from(args.concurrency),
        retry_policy: RetryPolicy::with_max_attempts(u32::from(args.max_retries)),
        politeness_delay: Duration::from_millis(args.rate_limit),
        fetch_timeout: Duration::from_secs(args.fetch_timeout),
        download_timeout: Duration::from_secs(args.download_timeout),
        dry_run: args.dry_run,
    };

    let store = LocalPersistence::open(&args.store, &args.db)
        .await
        .with_context(|| format!("opening metadata database {}", args.db.display()))?;
    let pipeline = Pipeline::new(settings, Arc::new(store))?;

    let summary = pipeline
        .run_config_dir(&args.configs)
        .await
        .with_context(|| format!("loading source configs from {}", args.configs.display()))?;
    summary.log();

    if let Some(path) = &args.summary_json {
        let json = summary.to_json_pretty()?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing summary to {}", path.display()))?;
        info!(path = %path.display(), "summary written");
    }

    if summary.totals.sources > 0 && summary.totals.sources_failed == summary.totals.sources {
        anyhow::bail!("every source failed");
    }
    Ok(())
}
