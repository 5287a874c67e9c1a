//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use harvester_core::{DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLITENESS_DELAY_MS};

/// Discover vendor manuals and ingest them into a content-addressed store.
///
/// Each `*.json` file in the config directory describes one vendor: where to
/// start, how deep to follow links, which hosts are in scope and which URLs
/// are documents.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Directory of per-vendor source configs (*.json)
    #[arg(long, default_value = "configs")]
    pub configs: PathBuf,

    /// Object store root directory
    #[arg(long, default_value = "store")]
    pub store: PathBuf,

    /// Metadata database file
    #[arg(long, default_value = "harvester.db")]
    pub db: PathBuf,

    /// Maximum concurrent artifact downloads per vendor (1-16)
    #[arg(short = 'c', long, default_value_t = DEFAULT_DOWNLOAD_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub concurrency: u8,

    /// Maximum download attempts for transient failures (0-10, 0 behaves as 1)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Minimum delay between requests to the same host in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, default_value_t = DEFAULT_POLITENESS_DELAY_MS, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: u64,

    /// Timeout for one page or API fetch, in seconds
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub fetch_timeout: u64,

    /// Timeout for one artifact download, in seconds
    #[arg(long, default_value_t = 120, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub download_timeout: u64,

    /// Discover and dedup only; download and store nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Write the run summary as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub summary_json: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
