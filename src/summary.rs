//! Per-source and run-wide outcome reporting.
//!
//! A [`RunSummary`] is logged at the end of every run and can be written as
//! JSON for operators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::extract::CandidateArtifact;
use crate::ingest::IngestionFailure;
use crate::storage::IngestionRecord;
use crate::traversal::TraversalReport;

/// How a source run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SourceStatus {
    /// Everything fetched and ingested cleanly.
    Completed,
    /// The run succeeded but discovered nothing.
    ZeroFound,
    /// Some page fetches or downloads failed.
    Degraded,
    /// The source could not run at all.
    Failed(String),
}

impl SourceStatus {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ZeroFound => "zero_found",
            Self::Degraded => "degraded",
            Self::Failed(_) => "failed",
        }
    }

    /// Derives the status of a source that ran to the end.
    #[must_use]
    pub fn derive(counts: &SourceCounts, traversal: &TraversalReport) -> Self {
        if traversal.is_degraded() || counts.failed > 0 {
            Self::Degraded
        } else if counts.discovered == 0 {
            Self::ZeroFound
        } else {
            Self::Completed
        }
    }
}

/// Candidate counts for one source, or totals across sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    /// Unique candidates streamed out of traversal.
    pub discovered: usize,
    /// Candidates dropped as already stored, by URL key or checksum.
    pub deduped: usize,
    /// New records inserted.
    pub ingested: usize,
    /// Candidates that failed to ingest.
    pub failed: usize,
}

impl SourceCounts {
    fn add(&mut self, other: &Self) {
        self.discovered += other.discovered;
        self.deduped += other.deduped;
        self.ingested += other.ingested;
        self.failed += other.failed;
    }
}

/// Outcome of one vendor.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    /// Vendor brand (the config file name if the config never loaded).
    pub brand: String,
    /// Final status.
    pub status: SourceStatus,
    /// Candidate counts.
    pub counts: SourceCounts,
    /// Traversal counters, absent if traversal never started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traversal: Option<TraversalReport>,
    /// Records inserted in this run.
    pub records: Vec<IngestionRecord>,
    /// Per-candidate failures.
    pub failures: Vec<IngestionFailure>,
    /// Novel candidates a dry run would have downloaded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<CandidateArtifact>,
    /// When the source started.
    pub started_at: DateTime<Utc>,
    /// When the source finished.
    pub finished_at: DateTime<Utc>,
}

impl SourceSummary {
    /// Summary for a source that could not run.
    #[must_use]
    pub fn failed(brand: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            brand: brand.into(),
            status: SourceStatus::Failed(reason.into()),
            counts: SourceCounts::default(),
            traversal: None,
            records: Vec::new(),
            failures: Vec::new(),
            planned: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// True if the status is [`SourceStatus::Failed`].
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SourceStatus::Failed(_))
    }
}

/// Run-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    /// Sources attempted.
    pub sources: usize,
    /// Sources that ended in [`SourceStatus::Failed`].
    pub sources_failed: usize,
    /// Sum of per-source counts.
    #[serde(flatten)]
    pub counts: SourceCounts,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Whether downloads were skipped.
    pub dry_run: bool,
    /// One entry per source, in run order.
    pub sources: Vec<SourceSummary>,
    /// Totals across sources.
    pub totals: RunTotals,
}

impl RunSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            sources: Vec::new(),
            totals: RunTotals::default(),
        }
    }

    /// Appends a source and updates the totals.
    pub fn push(&mut self, source: SourceSummary) {
        self.totals.sources += 1;
        if source.is_failed() {
            self.totals.sources_failed += 1;
        }
        self.totals.counts.add(&source.counts);
        self.sources.push(source);
    }

    /// True if at least one source failed outright.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.totals.sources_failed > 0
    }

    /// Finds a source by brand.
    #[must_use]
    pub fn source(&self, brand: &str) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.brand == brand)
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Logs one line per source and one for the totals.
    pub fn log(&self) {
        for source in &self.sources {
            let c = &source.counts;
            match &source.status {
                SourceStatus::Failed(reason) => {
                    warn!(brand = %source.brand, %reason, "source failed");
                }
                status => info!(
                    brand = %source.brand,
                    status = status.label(),
                    discovered = c.discovered,
                    deduped = c.deduped,
                    ingested = c.ingested,
                    failed = c.failed,
                    "source finished"
                ),
            }
            for failure in &source.failures {
                warn!(
                    brand = %source.brand,
                    url = %failure.artifact_url,
                    stage = ?failure.stage,
                    reason = %failure.reason,
                    "artifact not ingested"
                );
            }
        }
        let t = &self.totals;
        info!(
            sources = t.sources,
            sources_failed = t.sources_failed,
            discovered = t.counts.discovered,
            deduped = t.counts.deduped,
            ingested = t.counts.ingested,
            failed = t.counts.failed,
            dry_run = self.dry_run,
            "run complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn counts(discovered: usize, deduped: usize, ingested: usize, failed: usize) -> SourceCounts {
        SourceCounts {
            discovered,
            deduped,
            ingested,
            failed,
        }
    }

    #[test]
    fn test_status_derivation() {
        let clean = TraversalReport::default();
        let mut bad_page = TraversalReport::default();
        bad_page.pages_failed = 1;

        assert_eq!(SourceStatus::derive(&counts(2, 0, 2, 0), &clean), SourceStatus::Completed);
        assert_eq!(SourceStatus::derive(&counts(0, 0, 0, 0), &clean), SourceStatus::ZeroFound);
        assert_eq!(SourceStatus::derive(&counts(2, 0, 1, 1), &clean), SourceStatus::Degraded);
        assert_eq!(SourceStatus::derive(&counts(0, 0, 0, 0), &bad_page), SourceStatus::Degraded);
        // A full re-run dedups everything and is still a completed run.
        assert_eq!(SourceStatus::derive(&counts(2, 2, 0, 0), &clean), SourceStatus::Completed);
    }

    #[test]
    fn test_push_accumulates_totals() {
        let mut run = RunSummary::new(false);
        let mut acme = SourceSummary::failed("Acme", "placeholder");
        acme.status = SourceStatus::Completed;
        acme.counts = counts(2, 0, 2, 0);
        run.push(acme);
        run.push(SourceSummary::failed("broken.json", "malformed config"));

        assert_eq!(run.totals.sources, 2);
        assert_eq!(run.totals.sources_failed, 1);
        assert_eq!(run.totals.counts, counts(2, 0, 2, 0));
        assert!(run.has_failures());
        assert!(run.source("Acme").is_some());
    }

    #[test]
    fn test_json_shape() {
        let mut run = RunSummary::new(true);
        run.push(SourceSummary::failed("Acme", "all entry points failed"));
        let value: serde_json::Value = serde_json::from_str(&run.to_json_pretty().unwrap()).unwrap();

        assert_eq!(value["dry_run"], true);
        assert_eq!(value["totals"]["sources_failed"], 1);
        assert_eq!(value["totals"]["discovered"], 0);
        let source = &value["sources"][0];
        assert_eq!(source["status"]["state"], "failed");
        assert_eq!(source["status"]["reason"], "all entry points failed");
        assert!(source.get("traversal").is_none());
        assert!(source.get("planned").is_none());
    }

    #[test]
    fn test_planned_candidates_serialize_urls_as_strings() {
        let mut source = SourceSummary::failed("Acme", "placeholder");
        source.status = SourceStatus::Completed;
        source.planned.push(CandidateArtifact {
            brand: "Acme".to_string(),
            product_name: Some("Model 1".to_string()),
            artifact_url: url::Url::parse("https://acme.example/m1.pdf").unwrap(),
            source_url: url::Url::parse("https://acme.example/support").unwrap(),
            discovered_at: Utc::now(),
            size_hint: Some(2048),
        });
        let mut run = RunSummary::new(true);
        run.push(source);

        let value: serde_json::Value = serde_json::from_str(&run.to_json_pretty().unwrap()).unwrap();
        let planned = &value["sources"][0]["planned"][0];
        assert_eq!(planned["artifact_url"], "https://acme.example/m1.pdf");
        assert_eq!(planned["source_url"], "https://acme.example/support");
        assert_eq!(planned["size_hint"], 2048);
    }
}
