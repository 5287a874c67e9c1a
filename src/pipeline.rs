//! Orchestration of traversal, dedup and ingestion across vendors.
//!
//! Within a source, traversal runs in its own task and streams candidates
//! over a bounded channel; this side admits each one against the dedup
//! state and hands novel ones to the ingestion batch. Sources run one after
//! another, and a failing source is recorded without stopping the run.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, PipelineSettings, SourceConfig, load_source_configs};
use crate::dedup::{Admission, DedupEngine};
use crate::fetch::build_strategy;
use crate::http_client::{ClientBuildError, build_http_client};
use crate::ingest::{ArtifactClient, IngestError, IngestionCoordinator};
use crate::rate_limiter::RateLimiter;
use crate::storage::{FingerprintLedger, PersistencePort};
use crate::summary::{RunSummary, SourceCounts, SourceStatus, SourceSummary};
use crate::traversal::TraversalEngine;

/// Candidates buffered between traversal and ingestion, per worker.
const CHANNEL_SLOTS_PER_WORKER: usize = 4;

/// Errors raised while assembling a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Run settings are out of range.
    #[error(transparent)]
    Settings(#[from] ConfigError),

    /// The download client could not be built.
    #[error(transparent)]
    Client(#[from] ClientBuildError),

    /// The ingestion coordinator rejected its settings.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Runs vendor sources against one persistence backend.
pub struct Pipeline {
    settings: PipelineSettings,
    rate_limiter: Arc<RateLimiter>,
    ledger: Arc<dyn FingerprintLedger>,
    coordinator: IngestionCoordinator,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline writing to `store`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for invalid settings or when no HTTP client
    /// can be built.
    pub fn new<S>(settings: PipelineSettings, store: Arc<S>) -> Result<Self, PipelineError>
    where
        S: PersistencePort + FingerprintLedger + 'static,
    {
        settings.validate()?;
        let rate_limiter = Arc::new(RateLimiter::new(settings.politeness_delay));
        let client = ArtifactClient::new(build_http_client(settings.download_timeout)?);
        let ledger: Arc<dyn FingerprintLedger> = Arc::clone(&store) as Arc<dyn FingerprintLedger>;
        let coordinator = IngestionCoordinator::new(
            settings.download_concurrency,
            settings.retry_policy.clone(),
            Arc::clone(&rate_limiter),
            client,
            store,
            Arc::clone(&ledger),
        )?;
        Ok(Self {
            settings,
            rate_limiter,
            ledger,
            coordinator,
        })
    }

    /// Run settings.
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Loads every config in `dir` and runs them all.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] only when the directory itself is unusable;
    /// a malformed file becomes a failed source in the summary.
    pub async fn run_config_dir(&self, dir: &Path) -> Result<RunSummary, ConfigError> {
        let loaded = load_source_configs(dir)?
            .into_iter()
            .map(|(path, config)| {
                let label = path
                    .file_stem()
                    .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned());
                (label, config)
            })
            .collect();
        Ok(self.run_all(loaded).await)
    }

    /// Runs sources in order. Each entry is a label (used as the brand when
    /// the config failed to load) and the load result.
    #[instrument(skip_all, fields(sources = configs.len(), dry_run = self.settings.dry_run))]
    pub async fn run_all(
        &self,
        configs: Vec<(String, Result<SourceConfig, ConfigError>)>,
    ) -> RunSummary {
        let mut summary = RunSummary::new(self.settings.dry_run);
        for (label, config) in configs {
            let source = match config {
                Ok(config) => self.run_source(config).await,
                Err(e) => {
                    warn!(source = %label, error = %e, "source config unusable");
                    SourceSummary::failed(label, e.to_string())
                }
            };
            summary.push(source);
        }
        summary
    }

    /// Runs one source: traversal, dedup and ingestion.
    ///
    /// Never fails; problems are reported through the returned summary's
    /// status and failure list.
    #[instrument(skip_all, fields(brand = %config.brand))]
    pub async fn run_source(&self, config: SourceConfig) -> SourceSummary {
        let started_at = Utc::now();
        let brand = config.brand.clone();

        let strategy = match build_strategy(&config, &self.settings) {
            Ok(strategy) => strategy,
            Err(e) => return SourceSummary::failed(brand, e.to_string()),
        };
        let engine = match TraversalEngine::new(
            Arc::new(config),
            strategy,
            Arc::clone(&self.rate_limiter),
        ) {
            Ok(engine) => engine,
            Err(e) => return SourceSummary::failed(brand, e.to_string()),
        };
        let dedup = match DedupEngine::load(self.ledger.as_ref(), &brand).await {
            Ok(dedup) => Arc::new(dedup),
            Err(e) => return SourceSummary::failed(brand, format!("loading fingerprints: {e}")),
        };

        let (tx, mut rx) =
            mpsc::channel(self.settings.download_concurrency * CHANNEL_SLOTS_PER_WORKER);
        let traversal = tokio::spawn(async move { engine.run(tx).await });

        let mut counts = SourceCounts::default();
        let mut planned = Vec::new();
        let mut batch = self.coordinator.batch(Arc::clone(&dedup));
        let mut abort_reason = None;

        while let Some(candidate) = rx.recv().await {
            counts.discovered += 1;
            let url_key = match dedup.admit(&candidate) {
                Admission::Novel(key) => key,
                Admission::Duplicate(_) => {
                    counts.deduped += 1;
                    continue;
                }
            };
            if self.settings.dry_run {
                planned.push(candidate);
                continue;
            }
            if let Err(e) = batch.submit(candidate, url_key).await {
                warn!(error = %e, "ingestion stopped accepting work");
                abort_reason = Some(e.to_string());
                break;
            }
        }
        drop(rx);

        let traversal = match traversal.await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                abort_reason.get_or_insert_with(|| e.to_string());
                None
            }
            Err(e) => {
                abort_reason.get_or_insert_with(|| format!("traversal task failed: {e}"));
                None
            }
        };

        let report = batch.finish().await;
        counts.deduped += report.content_duplicates;
        counts.ingested = report.records.len();
        counts.failed = report.failures.len();

        let status = match (&abort_reason, &traversal) {
            (Some(reason), _) => SourceStatus::Failed(reason.clone()),
            (None, Some(t)) => SourceStatus::derive(&counts, t),
            (None, None) => SourceStatus::Failed("traversal did not report".to_string()),
        };

        info!(
            status = status.label(),
            discovered = counts.discovered,
            deduped = counts.deduped,
            ingested = counts.ingested,
            failed = counts.failed,
            planned = planned.len(),
            "source run finished"
        );

        SourceSummary {
            brand,
            status,
            counts,
            traversal,
            records: report.records,
            failures: report.failures,
            planned,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
