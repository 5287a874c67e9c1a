//! Breadth-first traversal of one vendor's pages.
//!
//! The engine owns the per-run visited set and frontier. Each visited page
//! is fetched with the source's [`FetchStrategy`], classified, and its
//! artifacts are streamed to the ingestion side immediately over an `mpsc`
//! channel, so downloads start while traversal is still running.
//!
//! Depth counts hops from an entry point (entry points are depth 0). Links
//! are only enqueued when `depth + 1 <= traversal_depth_limit`; artifacts
//! found on a page at the limit are still emitted.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{ConfigError, SourceConfig};
use crate::extract::{CandidateArtifact, ExtractContext, MarkupSelectors, classify};
use crate::fetch::FetchStrategy;
use crate::rate_limiter::RateLimiter;
use crate::url_norm::is_allowed;

/// A page scheduled for a visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalNode {
    /// Normalized page URL.
    pub url: Url,
    /// Hops from the entry point.
    pub depth: u32,
    /// Page the link was found on; `None` for entry points.
    pub parent_url: Option<Url>,
}

/// Counters from one traversal run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraversalReport {
    /// Pages fetched and classified.
    pub pages_visited: usize,
    /// Pages whose fetch failed (entry points included).
    pub pages_failed: usize,
    /// Entry points whose fetch failed.
    pub entry_points_failed: usize,
    /// Links dropped because their host is not allow-listed.
    pub links_skipped_off_domain: usize,
    /// Artifacts dropped because their host is not allow-listed.
    pub artifacts_skipped_off_domain: usize,
    /// Artifacts sent downstream (unique URLs).
    pub artifacts_emitted: usize,
    /// Payloads that matched no known list shape.
    pub unrecognized_payloads: usize,
}

impl TraversalReport {
    /// True when any page fetch failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.pages_failed > 0
    }
}

/// Traversal failures that abort a vendor.
#[derive(Debug, Error)]
pub enum TraversalError {
    /// Not a single entry point could be fetched.
    #[error("all {attempted} entry points failed for {brand}: {last_error}")]
    AllEntryPointsFailed {
        /// Vendor brand.
        brand: String,
        /// Number of distinct entry points tried.
        attempted: usize,
        /// Last fetch error seen.
        last_error: String,
    },
}

/// Frontier traversal for one source.
pub struct TraversalEngine {
    config: Arc<SourceConfig>,
    strategy: Box<dyn FetchStrategy>,
    rate_limiter: Arc<RateLimiter>,
    selectors: MarkupSelectors,
}

impl std::fmt::Debug for TraversalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversalEngine")
            .field("brand", &self.config.brand)
            .field("strategy", &self.strategy.kind())
            .finish_non_exhaustive()
    }
}

impl TraversalEngine {
    /// Creates an engine for `config` using `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `linkSelector` or
    /// `artifactSelector` is not valid CSS.
    pub fn new(
        config: Arc<SourceConfig>,
        strategy: Box<dyn FetchStrategy>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, ConfigError> {
        let selectors = MarkupSelectors::from_params(&config.strategy_params).map_err(|reason| {
            ConfigError::Invalid {
                origin: config.brand.clone(),
                reason,
            }
        })?;
        Ok(Self {
            config,
            strategy,
            rate_limiter,
            selectors,
        })
    }

    /// Runs the traversal, sending each newly found artifact on `tx`.
    ///
    /// Page fetch failures are logged and counted; they never stop the
    /// traversal. If the receiver is dropped, traversal stops early and the
    /// report so far is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TraversalError::AllEntryPointsFailed`] when no entry point
    /// could be fetched.
    #[instrument(skip(self, tx), fields(brand = %self.config.brand))]
    pub async fn run(
        &self,
        tx: mpsc::Sender<CandidateArtifact>,
    ) -> Result<TraversalReport, TraversalError> {
        let config = &self.config;
        let limit = config.traversal_depth_limit;
        let ctx = ExtractContext {
            brand: &config.brand,
            pattern: &config.artifact_pattern,
            selectors: &self.selectors,
        };

        let mut report = TraversalReport::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut emitted: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<TraversalNode> = config
            .entry_points
            .iter()
            .map(|url| TraversalNode {
                url: url.clone(),
                depth: 0,
                parent_url: None,
            })
            .collect();
        let distinct_entries: HashSet<&str> =
            config.entry_points.iter().map(Url::as_str).collect();
        let mut last_entry_error = String::new();

        info!(
            entry_points = distinct_entries.len(),
            depth_limit = limit,
            strategy = %self.strategy.kind(),
            "starting traversal"
        );

        'frontier: while let Some(node) = frontier.pop_front() {
            if node.depth > limit || !visited.insert(node.url.as_str().to_string()) {
                continue;
            }

            self.rate_limiter.acquire(node.url.as_str()).await;
            let raw = match self.strategy.fetch(&node.url).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        url = %node.url,
                        depth = node.depth,
                        parent = node.parent_url.as_ref().map_or("-", Url::as_str),
                        kind = e.kind(),
                        error = %e,
                        "page fetch failed"
                    );
                    report.pages_failed += 1;
                    if node.depth == 0 {
                        report.entry_points_failed += 1;
                        last_entry_error = e.to_string();
                    }
                    continue;
                }
            };
            report.pages_visited += 1;

            let base = raw.base_url().clone();
            let extraction = classify(&raw, &base, &ctx);

            for note in &extraction.notes {
                warn!(url = %node.url, note = %note, "payload not recognized");
                report.unrecognized_payloads += 1;
            }

            for artifact in extraction.artifacts {
                if !is_allowed(&artifact.artifact_url, &config.domain_allow_list) {
                    debug!(url = %artifact.artifact_url, "artifact outside allow-list");
                    report.artifacts_skipped_off_domain += 1;
                    continue;
                }
                if !emitted.insert(artifact.artifact_url.as_str().to_string()) {
                    continue;
                }
                debug!(url = %artifact.artifact_url, title = artifact.title(), "artifact found");
                if tx.send(artifact).await.is_err() {
                    warn!("artifact receiver closed, stopping traversal");
                    break 'frontier;
                }
                report.artifacts_emitted += 1;
            }

            if node.depth >= limit {
                continue;
            }
            for link in extraction.links {
                if !is_allowed(&link, &config.domain_allow_list) {
                    report.links_skipped_off_domain += 1;
                    continue;
                }
                if visited.contains(link.as_str()) {
                    continue;
                }
                frontier.push_back(TraversalNode {
                    url: link,
                    depth: node.depth + 1,
                    parent_url: Some(node.url.clone()),
                });
            }
        }

        if !distinct_entries.is_empty() && report.entry_points_failed >= distinct_entries.len() {
            return Err(TraversalError::AllEntryPointsFailed {
                brand: config.brand.clone(),
                attempted: distinct_entries.len(),
                last_error: last_entry_error,
            });
        }

        info!(
            pages_visited = report.pages_visited,
            pages_failed = report.pages_failed,
            artifacts = report.artifacts_emitted,
            off_domain_links = report.links_skipped_off_domain,
            "traversal complete"
        );
        Ok(report)
    }
}
