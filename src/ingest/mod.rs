//! Bounded-parallel artifact ingestion.
//!
//! The [`IngestionCoordinator`] takes the novel candidates of one source run
//! and, for each one, downloads the bytes, checks the content checksum,
//! writes the object if absent and upserts the metadata record. Every step
//! is idempotent, so a run interrupted halfway converges when re-run.
//!
//! # Concurrency
//!
//! - Each candidate runs in its own Tokio task
//! - A semaphore permit is acquired before the task is spawned, so
//!   [`IngestionBatch::submit`] applies backpressure to the traversal channel
//! - Permits are released when the task finishes (RAII)
//!
//! A failed candidate is recorded as an [`IngestionFailure`]; it never
//! aborts the batch.

mod client;
mod error;
mod filename;
mod retry;

pub use client::{ArtifactClient, DownloadedArtifact, MAX_ARTIFACT_BYTES};
pub use error::DownloadError;
pub use filename::{brand_slug, derive_file_name};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::MAX_DOWNLOAD_CONCURRENCY;
use crate::dedup::{ContentCheck, DedupEngine, Fingerprint};
use crate::extract::CandidateArtifact;
use crate::rate_limiter::{RateLimiter, parse_retry_after};
use crate::storage::{
    FingerprintLedger, IngestionRecord, MetadataError, PersistencePort, UpsertOutcome,
    storage_location,
};

/// Errors that stop a batch from accepting work.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Concurrency outside `1..=16`.
    #[error("invalid download concurrency {value}: must be between 1 and {MAX_DOWNLOAD_CONCURRENCY}")]
    InvalidConcurrency {
        /// Rejected value.
        value: usize,
    },

    /// The worker semaphore was closed.
    #[error("ingestion semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Step at which a candidate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Fetching the bytes.
    Download,
    /// Writing the object.
    Store,
    /// Upserting the metadata record.
    Metadata,
    /// The worker task itself died.
    Worker,
}

/// A candidate that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionFailure {
    /// Artifact URL.
    pub artifact_url: String,
    /// Page the artifact was found on.
    pub source_url: String,
    /// Failed step.
    pub stage: FailureStage,
    /// Last error message.
    pub reason: String,
    /// Attempts made at the failed step.
    pub attempts: u32,
}

/// Atomic counters shared by a batch's tasks.
#[derive(Debug, Default)]
pub struct IngestionStats {
    ingested: AtomicUsize,
    deduped: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl IngestionStats {
    /// Candidates stored as new records.
    #[must_use]
    pub fn ingested(&self) -> usize {
        self.ingested.load(Ordering::SeqCst)
    }

    /// Candidates dropped after download because their checksum was known.
    #[must_use]
    pub fn deduped(&self) -> usize {
        self.deduped.load(Ordering::SeqCst)
    }

    /// Candidates that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts across all candidates.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of one ingestion batch.
#[derive(Debug, Default)]
pub struct IngestionReport {
    /// Records inserted during the batch.
    pub records: Vec<IngestionRecord>,
    /// Candidates that failed.
    pub failures: Vec<IngestionFailure>,
    /// Candidates whose bytes were already stored.
    pub content_duplicates: usize,
    /// URL aliases written to the ledger.
    pub aliases_recorded: usize,
    /// Retry attempts made.
    pub retried: usize,
}

enum ItemOutcome {
    Ingested(IngestionRecord),
    Duplicate {
        url_key: Fingerprint,
        checksum: Fingerprint,
    },
    Failed(IngestionFailure),
}

/// Downloads, deduplicates and stores novel candidates for one source.
pub struct IngestionCoordinator {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    client: ArtifactClient,
    store: Arc<dyn PersistencePort>,
    ledger: Arc<dyn FingerprintLedger>,
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("concurrency", &self.concurrency)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl IngestionCoordinator {
    /// Creates a coordinator running at most `concurrency` downloads at once.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConcurrency`] outside `1..=16`.
    #[instrument(level = "debug", skip_all, fields(concurrency = concurrency))]
    pub fn new(
        concurrency: usize,
        retry_policy: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        client: ArtifactClient,
        store: Arc<dyn PersistencePort>,
        ledger: Arc<dyn FingerprintLedger>,
    ) -> Result<Self, IngestError> {
        if !(1..=MAX_DOWNLOAD_CONCURRENCY).contains(&concurrency) {
            return Err(IngestError::InvalidConcurrency { value: concurrency });
        }
        debug!(
            max_attempts = retry_policy.max_attempts(),
            politeness_ms = rate_limiter.delay().as_millis(),
            "creating ingestion coordinator"
        );
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retry_policy,
            rate_limiter,
            client,
            store,
            ledger,
        })
    }

    /// Configured concurrency.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts a batch that checks content against `dedup`.
    #[must_use]
    pub fn batch(&self, dedup: Arc<DedupEngine>) -> IngestionBatch<'_> {
        IngestionBatch {
            coordinator: self,
            dedup,
            stats: Arc::new(IngestionStats::default()),
            handles: Vec::new(),
        }
    }
}

/// In-flight ingestion for one source run.
pub struct IngestionBatch<'a> {
    coordinator: &'a IngestionCoordinator,
    dedup: Arc<DedupEngine>,
    stats: Arc<IngestionStats>,
    handles: Vec<(CandidateArtifact, JoinHandle<ItemOutcome>)>,
}

impl IngestionBatch<'_> {
    /// Live counters for this batch.
    #[must_use]
    pub fn stats(&self) -> &IngestionStats {
        &self.stats
    }

    /// Schedules `candidate`, waiting for a free worker slot first.
    ///
    /// `url_key` is the key returned by [`DedupEngine::admit`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::SemaphoreClosed`] if the semaphore was closed.
    pub async fn submit(
        &mut self,
        candidate: CandidateArtifact,
        url_key: Fingerprint,
    ) -> Result<(), IngestError> {
        let permit = Arc::clone(&self.coordinator.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| IngestError::SemaphoreClosed)?;

        let worker = self.worker();
        let task_candidate = candidate.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            worker.ingest(task_candidate, url_key).await
        });
        self.handles.push((candidate, handle));
        Ok(())
    }

    fn worker(&self) -> Worker {
        Worker {
            client: self.coordinator.client.clone(),
            retry_policy: self.coordinator.retry_policy.clone(),
            rate_limiter: Arc::clone(&self.coordinator.rate_limiter),
            store: Arc::clone(&self.coordinator.store),
            dedup: Arc::clone(&self.dedup),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Waits for every scheduled candidate and records URL aliases for
    /// content duplicates of persisted checksums.
    ///
    /// A candidate that lost the checksum claim to a worker which later
    /// failed is ingested again here, one at a time, so its bytes are not
    /// lost for the run.
    #[instrument(skip(self), fields(brand = self.dedup.brand(), tasks = self.handles.len()))]
    pub async fn finish(mut self) -> IngestionReport {
        let mut report = IngestionReport::default();
        let mut duplicates = Vec::new();
        let mut unresolved = Vec::new();

        for (candidate, handle) in std::mem::take(&mut self.handles) {
            match handle.await {
                Ok(ItemOutcome::Ingested(record)) => report.records.push(record),
                Ok(ItemOutcome::Duplicate { url_key, checksum }) => {
                    unresolved.push((candidate, url_key, checksum));
                }
                Ok(ItemOutcome::Failed(failure)) => report.failures.push(failure),
                Err(e) => {
                    warn!(url = %candidate.artifact_url, error = %e, "ingestion task panicked");
                    IngestionStats::increment(&self.stats.failed);
                    report.failures.push(IngestionFailure {
                        artifact_url: candidate.artifact_url.to_string(),
                        source_url: candidate.source_url.to_string(),
                        stage: FailureStage::Worker,
                        reason: e.to_string(),
                        attempts: 0,
                    });
                }
            }
        }

        // Every worker has finished, so each claim is either persisted or
        // released by now.
        for (candidate, url_key, checksum) in unresolved {
            if self.dedup.is_persisted(&checksum) {
                duplicates.push((url_key, checksum));
                continue;
            }
            info!(
                url = %candidate.artifact_url,
                %checksum,
                "content claimer failed, ingesting duplicate instead"
            );
            IngestionStats::decrement(&self.stats.deduped);
            match self.worker().ingest(candidate, url_key).await {
                ItemOutcome::Ingested(record) => report.records.push(record),
                ItemOutcome::Duplicate { url_key, checksum } => {
                    duplicates.push((url_key, checksum));
                }
                ItemOutcome::Failed(failure) => report.failures.push(failure),
            }
        }
        report.content_duplicates = duplicates.len();

        for (url_key, checksum) in duplicates {
            if !self.dedup.is_persisted(&checksum) {
                debug!(%checksum, "duplicate of an unpersisted checksum, alias skipped");
                continue;
            }
            match self
                .coordinator
                .ledger
                .record_alias(self.dedup.brand(), url_key.as_str(), checksum.as_str())
                .await
            {
                Ok(()) => report.aliases_recorded += 1,
                Err(e) => warn!(%checksum, error = %e, "failed to record URL alias"),
            }
        }

        report.retried = self.stats.retried();
        info!(
            ingested = report.records.len(),
            duplicates = report.content_duplicates,
            failed = report.failures.len(),
            retried = report.retried,
            "ingestion batch complete"
        );
        report
    }
}

/// Everything a spawned task needs, cloned out of the coordinator.
struct Worker {
    client: ArtifactClient,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    store: Arc<dyn PersistencePort>,
    dedup: Arc<DedupEngine>,
    stats: Arc<IngestionStats>,
}

impl Worker {
    #[instrument(skip_all, fields(url = %candidate.artifact_url))]
    async fn ingest(self, candidate: CandidateArtifact, url_key: Fingerprint) -> ItemOutcome {
        let downloaded = match self.download_with_retry(&candidate.artifact_url).await {
            Ok(downloaded) => downloaded,
            Err((e, attempts)) => {
                warn!(error = %e, attempts, "download failed after all attempts");
                return self.fail(&candidate, FailureStage::Download, &e, attempts);
            }
        };

        let checksum = Fingerprint::checksum(&downloaded.bytes);
        if self.dedup.check_content(&checksum) == ContentCheck::Duplicate {
            debug!(%checksum, "content already stored");
            IngestionStats::increment(&self.stats.deduped);
            return ItemOutcome::Duplicate { url_key, checksum };
        }

        let file_name = derive_file_name(&candidate, downloaded.content_type.as_deref());
        let location = storage_location(
            &brand_slug(&candidate.brand),
            checksum.as_str(),
            &file_name,
        );

        if let Err(e) = self.store_object(&location, &downloaded).await {
            warn!(location = %location, error = %e, "object write failed");
            self.dedup.release(&checksum);
            return self.fail(&candidate, FailureStage::Store, &e, 1);
        }

        let record = IngestionRecord {
            brand: candidate.brand.clone(),
            product_name: candidate.title().to_string(),
            file_name,
            storage_location: location,
            source_url: candidate.source_url.to_string(),
            artifact_url: candidate.artifact_url.to_string(),
            checksum: checksum.as_str().to_string(),
            size_bytes: downloaded.bytes.len() as u64,
            inserted_at: Utc::now(),
        };

        match self.upsert_with_retry(&record).await {
            Ok(UpsertOutcome::Inserted) => {
                self.dedup.record_ingested(&url_key, &checksum);
                IngestionStats::increment(&self.stats.ingested);
                info!(location = %record.storage_location, bytes = record.size_bytes, "artifact ingested");
                ItemOutcome::Ingested(record)
            }
            Ok(UpsertOutcome::AlreadyPresent) => {
                self.dedup.record_ingested(&url_key, &checksum);
                IngestionStats::increment(&self.stats.deduped);
                debug!(%checksum, "metadata already present");
                ItemOutcome::Duplicate { url_key, checksum }
            }
            Err((e, attempts)) => {
                warn!(error = %e, attempts, "metadata upsert failed");
                self.dedup.release(&checksum);
                self.fail(&candidate, FailureStage::Metadata, &e, attempts)
            }
        }
    }

    fn fail(
        &self,
        candidate: &CandidateArtifact,
        stage: FailureStage,
        error: &dyn std::fmt::Display,
        attempts: u32,
    ) -> ItemOutcome {
        IngestionStats::increment(&self.stats.failed);
        ItemOutcome::Failed(IngestionFailure {
            artifact_url: candidate.artifact_url.to_string(),
            source_url: candidate.source_url.to_string(),
            stage,
            reason: error.to_string(),
            attempts,
        })
    }

    async fn store_object(
        &self,
        location: &str,
        downloaded: &DownloadedArtifact,
    ) -> Result<(), crate::storage::StorageError> {
        if self.store.object_exists(location).await? {
            debug!(location, "object already present, skipping write");
            return Ok(());
        }
        self.store
            .put_object(location, &downloaded.bytes, downloaded.content_type_or_default())
            .await
    }

    /// Downloads with backoff; returns the last error and attempt count when
    /// the policy gives up.
    async fn download_with_retry(
        &self,
        url: &Url,
    ) -> Result<DownloadedArtifact, (DownloadError, u32)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.rate_limiter.acquire(url.as_str()).await;

            let error = match self.client.download(url).await {
                Ok(downloaded) => return Ok(downloaded),
                Err(e) => e,
            };

            let failure_type = classify_error(&error);
            let server_delay = if failure_type == FailureType::RateLimited {
                self.honour_retry_after(&error, url).await
            } else {
                None
            };

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    let delay = server_delay.unwrap_or(delay);
                    info!(
                        attempt = next_attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = server_delay.is_some(),
                        error = %error,
                        "retrying download"
                    );
                    IngestionStats::increment(&self.stats.retried);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "not retrying download");
                    return Err((error, attempt));
                }
            }
        }
    }

    /// Parses `Retry-After` and pushes the host's next slot back by it.
    async fn honour_retry_after(&self, error: &DownloadError, url: &Url) -> Option<Duration> {
        let header = error.retry_after()?;
        let delay = parse_retry_after(header)?;
        self.rate_limiter.record_retry_after(url.as_str(), delay).await;
        debug!(retry_after = header, delay_ms = delay.as_millis(), "honouring Retry-After");
        Some(delay)
    }

    async fn upsert_with_retry(
        &self,
        record: &IngestionRecord,
    ) -> Result<UpsertOutcome, (MetadataError, u32)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.store.upsert_metadata(record).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            let failure_type = if error.is_transient() {
                FailureType::Transient
            } else {
                FailureType::Permanent
            };
            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    debug!(error = %error, delay_ms = delay.as_millis(), "retrying metadata upsert");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { .. } => return Err((error, attempt)),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use async_trait::async_trait;

    use crate::dedup::Admission;
    use crate::http_client::build_http_client;
    use crate::storage::{KnownFingerprints, MemoryPersistence, StorageError};

    /// Memory store whose writes to `broken` locations stall, then fail.
    struct StallingStore {
        inner: Arc<MemoryPersistence>,
        stall: Duration,
    }

    #[async_trait]
    impl PersistencePort for StallingStore {
        async fn object_exists(&self, path: &str) -> Result<bool, StorageError> {
            self.inner.object_exists(path).await
        }

        async fn put_object(
            &self,
            path: &str,
            bytes: &[u8],
            content_type: &str,
        ) -> Result<(), StorageError> {
            if path.contains("broken") {
                tokio::time::sleep(self.stall).await;
                return Err(StorageError::WriteFailed {
                    path: path.to_string(),
                    source: std::io::Error::other("disk went away"),
                });
            }
            self.inner.put_object(path, bytes, content_type).await
        }

        async fn upsert_metadata(
            &self,
            record: &IngestionRecord,
        ) -> Result<UpsertOutcome, MetadataError> {
            self.inner.upsert_metadata(record).await
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40), 2.0)
    }

    fn coordinator(store: &Arc<MemoryPersistence>) -> IngestionCoordinator {
        IngestionCoordinator::new(
            4,
            fast_policy(),
            Arc::new(RateLimiter::disabled()),
            ArtifactClient::new(build_http_client(Duration::from_secs(5)).unwrap()),
            Arc::clone(store) as Arc<dyn PersistencePort>,
            Arc::clone(store) as Arc<dyn FingerprintLedger>,
        )
        .unwrap()
    }

    fn candidate(url: &str, product: Option<&str>) -> CandidateArtifact {
        CandidateArtifact {
            brand: "Acme".to_string(),
            product_name: product.map(str::to_string),
            artifact_url: Url::parse(url).unwrap(),
            source_url: Url::parse("https://acme.example/support").unwrap(),
            discovered_at: Utc::now(),
            size_hint: None,
        }
    }

    async fn ingest_all(
        coordinator: &IngestionCoordinator,
        dedup: &Arc<DedupEngine>,
        candidates: Vec<CandidateArtifact>,
    ) -> IngestionReport {
        let mut batch = coordinator.batch(Arc::clone(dedup));
        for c in candidates {
            let Admission::Novel(key) = dedup.admit(&c) else {
                continue;
            };
            batch.submit(c, key).await.unwrap();
        }
        batch.finish().await
    }

    async fn pdf(server: &MockServer, route: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(body.to_vec()),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_invalid_concurrency_rejected() {
        let store = Arc::new(MemoryPersistence::new());
        for value in [0, MAX_DOWNLOAD_CONCURRENCY + 1] {
            let result = IngestionCoordinator::new(
                value,
                RetryPolicy::default(),
                Arc::new(RateLimiter::disabled()),
                ArtifactClient::new(build_http_client(Duration::from_secs(1)).unwrap()),
                Arc::clone(&store) as Arc<dyn PersistencePort>,
                Arc::clone(&store) as Arc<dyn FingerprintLedger>,
            );
            assert!(matches!(result, Err(IngestError::InvalidConcurrency { .. })));
        }
    }

    #[tokio::test]
    async fn test_ingests_distinct_artifacts() {
        let server = MockServer::start().await;
        pdf(&server, "/m1.pdf", b"%PDF m1").await;
        pdf(&server, "/m2.pdf", b"%PDF m2").await;

        let store = Arc::new(MemoryPersistence::new());
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator(&store),
            &dedup,
            vec![
                candidate(&format!("{}/m1.pdf", server.uri()), Some("Model 1")),
                candidate(&format!("{}/m2.pdf", server.uri()), None),
            ],
        )
        .await;

        assert_eq!(report.records.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(store.object_count(), 2);

        let records = store.records();
        let m1 = records.iter().find(|r| r.file_name == "Model_1.pdf").unwrap();
        assert_eq!(m1.product_name, "Model 1");
        assert!(m1.storage_location.starts_with("acme/"));
        assert_eq!(store.object(&m1.storage_location).unwrap().1, "application/pdf");
        let m2 = records.iter().find(|r| r.file_name == "m2.pdf").unwrap();
        assert_eq!(m2.product_name, "Manual");
    }

    #[tokio::test]
    async fn test_content_duplicate_collapses_and_records_alias() {
        let server = MockServer::start().await;
        pdf(&server, "/a/m1.pdf", b"%PDF same").await;
        pdf(&server, "/b/m1-copy.pdf", b"%PDF same").await;

        let store = Arc::new(MemoryPersistence::new());
        let coordinator = coordinator(&store);
        let first = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator,
            &first,
            vec![
                candidate(&format!("{}/a/m1.pdf", server.uri()), None),
                candidate(&format!("{}/b/m1-copy.pdf", server.uri()), None),
            ],
        )
        .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.content_duplicates, 1);
        assert_eq!(report.aliases_recorded, 1);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.object_count(), 1);

        // Next run drops both URLs before download.
        let second = DedupEngine::load(store.as_ref(), "Acme").await.unwrap();
        for route in ["/a/m1.pdf", "/b/m1-copy.pdf"] {
            let c = candidate(&format!("{}{route}", server.uri()), None);
            assert!(matches!(second.admit(&c), Admission::Duplicate(_)), "{route}");
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.pdf"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        pdf(&server, "/flaky.pdf", b"%PDF flaky").await;

        let store = Arc::new(MemoryPersistence::new());
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator(&store),
            &dedup,
            vec![candidate(&format!("{}/flaky.pdf", server.uri()), None)],
        )
        .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.retried, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_download_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy.pdf"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        pdf(&server, "/busy.pdf", b"%PDF busy").await;

        let store = Arc::new(MemoryPersistence::new());
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator(&store),
            &dedup,
            vec![candidate(&format!("{}/busy.pdf", server.uri()), None)],
        )
        .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.retried, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_affect_siblings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        pdf(&server, "/ok.pdf", b"%PDF ok").await;

        let store = Arc::new(MemoryPersistence::new());
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator(&store),
            &dedup,
            vec![
                candidate(&format!("{}/gone.pdf", server.uri()), None),
                candidate(&format!("{}/ok.pdf", server.uri()), None),
            ],
        )
        .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.stage, FailureStage::Download);
        assert_eq!(failure.attempts, 1);
        assert!(failure.reason.contains("404"), "{}", failure.reason);
    }

    #[tokio::test]
    async fn test_store_failure_releases_checksum() {
        let server = MockServer::start().await;
        pdf(&server, "/a/broken.pdf", b"%PDF shared").await;
        pdf(&server, "/b/fine.pdf", b"%PDF shared").await;

        let store = Arc::new(MemoryPersistence::new());
        store.fail_writes_matching("broken");
        let coordinator = IngestionCoordinator::new(
            1,
            fast_policy(),
            Arc::new(RateLimiter::disabled()),
            ArtifactClient::new(build_http_client(Duration::from_secs(5)).unwrap()),
            Arc::clone(&store) as Arc<dyn PersistencePort>,
            Arc::clone(&store) as Arc<dyn FingerprintLedger>,
        )
        .unwrap();
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator,
            &dedup,
            vec![
                candidate(&format!("{}/a/broken.pdf", server.uri()), None),
                candidate(&format!("{}/b/fine.pdf", server.uri()), None),
            ],
        )
        .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Store);
        // The second URL serves the same bytes and can still store them.
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].file_name, "fine.pdf");
        assert_eq!(report.aliases_recorded, 0);
    }

    #[tokio::test]
    async fn test_failed_claim_hands_content_to_concurrent_duplicate() {
        let server = MockServer::start().await;
        pdf(&server, "/a/broken.pdf", b"%PDF shared").await;
        Mock::given(method("GET"))
            .and(path("/b/fine.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(b"%PDF shared".to_vec())
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let memory = Arc::new(MemoryPersistence::new());
        let store = Arc::new(StallingStore {
            inner: Arc::clone(&memory),
            stall: Duration::from_millis(300),
        });
        let coordinator = IngestionCoordinator::new(
            2,
            fast_policy(),
            Arc::new(RateLimiter::disabled()),
            ArtifactClient::new(build_http_client(Duration::from_secs(5)).unwrap()),
            store as Arc<dyn PersistencePort>,
            Arc::clone(&memory) as Arc<dyn FingerprintLedger>,
        )
        .unwrap();
        let dedup = Arc::new(DedupEngine::from_known("Acme", KnownFingerprints::default()));
        let report = ingest_all(
            &coordinator,
            &dedup,
            vec![
                candidate(&format!("{}/a/broken.pdf", server.uri()), None),
                candidate(&format!("{}/b/fine.pdf", server.uri()), None),
            ],
        )
        .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Store);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].file_name, "fine.pdf");
        assert_eq!(report.content_duplicates, 0);
        assert_eq!(report.aliases_recorded, 0);
        assert_eq!(memory.records().len(), 1);
        assert_eq!(memory.object_count(), 1);
    }
}
