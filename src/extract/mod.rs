//! Classification of fetched content into traversal links and artifacts.
//!
//! [`classify`] is pure: it parses what a fetch strategy returned and never
//! touches the network. Markup is walked with `scraper`; structured payloads
//! are probed against an ordered table of known list envelopes.

mod markup;
mod structured;

pub use markup::MarkupSelectors;
pub use structured::{LIST_RULES, ListRule};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ArtifactPattern;
use crate::fetch::RawContent;

/// Title used when neither the page nor the payload names the document.
pub const DEFAULT_TITLE: &str = "Manual";

/// A document reference found during traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateArtifact {
    /// Vendor that owns the document.
    pub brand: String,
    /// Product or document title, when the source offered one.
    pub product_name: Option<String>,
    /// Normalized absolute URL of the artifact.
    pub artifact_url: Url,
    /// Page or endpoint the reference was found on.
    pub source_url: Url,
    /// When the reference was extracted.
    pub discovered_at: DateTime<Utc>,
    /// Size advertised by the source, in bytes.
    pub size_hint: Option<u64>,
}

impl CandidateArtifact {
    /// Returns the product name, or [`DEFAULT_TITLE`] when none was found.
    #[must_use]
    pub fn title(&self) -> &str {
        self.product_name.as_deref().unwrap_or(DEFAULT_TITLE)
    }
}

/// A non-fatal extraction note.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// A structured payload matched none of the known list envelopes.
    #[error("unrecognized payload shape at {url} (top-level keys: {keys:?})")]
    UnrecognizedShape {
        /// Endpoint or page the payload came from.
        url: String,
        /// Top-level object keys, to help write a new rule.
        keys: Vec<String>,
    },
}

/// Per-source inputs to classification.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    /// Brand stamped on every candidate.
    pub brand: &'a str,
    /// Artifact matcher.
    pub pattern: &'a ArtifactPattern,
    /// Optional CSS narrowing for markup.
    pub selectors: &'a MarkupSelectors,
}

/// Links and artifacts found in one fetch.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Normalized references to other pages.
    pub links: Vec<Url>,
    /// Document candidates, unique by URL within this extraction.
    pub artifacts: Vec<CandidateArtifact>,
    /// Non-fatal notes (unrecognized payload shapes).
    pub notes: Vec<ExtractionError>,
}

impl Extraction {
    fn push_link(&mut self, url: Url, seen: &mut HashSet<String>) {
        if seen.insert(url.as_str().to_string()) {
            self.links.push(url);
        }
    }

    /// Adds an artifact, merging metadata into an earlier hit on the same URL.
    fn push_artifact(&mut self, candidate: CandidateArtifact) {
        if let Some(existing) = self
            .artifacts
            .iter_mut()
            .find(|a| a.artifact_url == candidate.artifact_url)
        {
            if existing.product_name.is_none() {
                existing.product_name = candidate.product_name;
            }
            if existing.size_hint.is_none() {
                existing.size_hint = candidate.size_hint;
            }
            return;
        }
        self.artifacts.push(candidate);
    }

    fn merge(&mut self, other: Self, seen_links: &mut HashSet<String>) {
        for link in other.links {
            self.push_link(link, seen_links);
        }
        for artifact in other.artifacts {
            self.push_artifact(artifact);
        }
        self.notes.extend(other.notes);
    }
}

/// Classifies fetched content.
///
/// Relative references resolve against `base_url` (or a `<base href>` in
/// markup). Rendered content runs the markup rules on the DOM and the
/// structured rules on every captured JSON response.
#[must_use]
pub fn classify(raw: &RawContent, base_url: &Url, ctx: &ExtractContext<'_>) -> Extraction {
    let discovered_at = Utc::now();
    let extraction = match raw {
        RawContent::Markup { html, .. } => markup::extract(html, base_url, ctx, discovered_at),
        RawContent::Structured { payload, .. } => {
            structured::extract(payload, base_url, ctx, discovered_at)
        }
        RawContent::Rendered { html, captured, .. } => {
            let mut extraction = markup::extract(html, base_url, ctx, discovered_at);
            let mut seen: HashSet<String> = extraction
                .links
                .iter()
                .map(|u| u.as_str().to_string())
                .collect();
            for response in captured {
                let mut found = structured::extract(&response.payload, base_url, ctx, discovered_at);
                // Most background responses are not file lists.
                found.notes.clear();
                debug!(
                    url = %response.url,
                    artifacts = found.artifacts.len(),
                    "captured response classified"
                );
                extraction.merge(found, &mut seen);
            }
            extraction
        }
    };

    debug!(
        base = %base_url,
        links = extraction.links.len(),
        artifacts = extraction.artifacts.len(),
        "content classified"
    );
    extraction
}
