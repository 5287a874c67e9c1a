//! Manual Harvester Core Library
//!
//! Crawls vendor support sites for product manuals and spec sheets and
//! ingests each unique document once into a content-addressed store with a
//! metadata catalogue.
//!
//! # Architecture
//!
//! - [`config`] - Per-vendor source configs and run settings
//! - [`fetch`] - Static, API and rendered-browser fetch strategies
//! - [`extract`] - Artifact and link extraction from markup and JSON
//! - [`traversal`] - Bounded breadth-first crawl of one vendor
//! - [`dedup`] - URL-key and checksum fingerprints
//! - [`ingest`] - Concurrent download, checksum and store
//! - [`storage`] / [`db`] - Object store, `SQLite` metadata and ledger
//! - [`pipeline`] / [`summary`] - Orchestration and run reporting

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod dedup;
pub mod extract;
pub mod fetch;
pub mod http_client;
pub mod ingest;
pub mod pipeline;
pub mod rate_limiter;
pub mod storage;
pub mod summary;
pub mod traversal;
pub mod url_norm;
mod user_agent;

// Re-export commonly used types
pub use config::{
    ArtifactPattern, ConfigError, DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_POLITENESS_DELAY_MS,
    FetchStrategyKind, PipelineSettings, SourceConfig, load_source_config, load_source_configs,
};
pub use db::{Database, DbError};
pub use dedup::{Admission, ContentCheck, DedupEngine, Fingerprint};
pub use extract::{CandidateArtifact, ExtractionError};
pub use fetch::{FetchError, FetchStrategy, RawContent, build_strategy};
pub use ingest::{
    DEFAULT_MAX_ATTEMPTS, DownloadError, FailureType, IngestionCoordinator, IngestionFailure,
    RetryDecision, RetryPolicy, classify_error,
};
pub use pipeline::{Pipeline, PipelineError};
pub use rate_limiter::RateLimiter;
pub use storage::{
    FingerprintLedger, FsObjectStore, IngestionRecord, LocalPersistence, MemoryPersistence,
    MetadataError, PersistencePort, SqliteMetadataStore, StorageError, UpsertOutcome,
};
pub use summary::{RunSummary, SourceCounts, SourceStatus, SourceSummary};
pub use traversal::{TraversalEngine, TraversalError, TraversalReport};
