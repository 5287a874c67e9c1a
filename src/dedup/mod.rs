//! Fingerprint-based deduplication.
//!
//! Dedup runs twice per candidate: [`DedupEngine::admit`] before download,
//! keyed by URL, and [`DedupEngine::check_content`] after download, keyed
//! by checksum. The second check catches one file served from two URLs.
//!
//! State is loaded once per source from the [`FingerprintLedger`] and then
//! kept in `DashSet`s, so concurrent ingestion workers can admit and claim
//! without a run-wide lock.

mod fingerprint;

pub use fingerprint::Fingerprint;

use dashmap::DashSet;
use tracing::{debug, instrument};

use crate::extract::CandidateArtifact;
use crate::storage::{FingerprintLedger, KnownFingerprints, MetadataError};

/// Pre-download verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Not seen before; carries the URL key.
    Novel(Fingerprint),
    /// Already ingested, aliased, or admitted earlier in this run.
    Duplicate(Fingerprint),
}

/// Post-download verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCheck {
    /// This worker now owns the checksum and should store the bytes.
    Novel,
    /// Stored already, or claimed by another worker in this run.
    Duplicate,
}

/// Dedup state for one source run.
#[derive(Debug)]
pub struct DedupEngine {
    brand: String,
    url_keys: DashSet<String>,
    checksums: DashSet<String>,
    persisted: DashSet<String>,
}

impl DedupEngine {
    /// Loads the persisted fingerprints for `brand`.
    ///
    /// # Errors
    ///
    /// Returns the ledger's [`MetadataError`] if the load fails.
    #[instrument(skip(ledger))]
    pub async fn load(ledger: &dyn FingerprintLedger, brand: &str) -> Result<Self, MetadataError> {
        let known = ledger.load_known(brand).await?;
        debug!(
            url_keys = known.url_keys.len(),
            checksums = known.checksums.len(),
            "loaded known fingerprints"
        );
        Ok(Self::from_known(brand, known))
    }

    /// Builds an engine from already-loaded fingerprints.
    #[must_use]
    pub fn from_known(brand: &str, known: KnownFingerprints) -> Self {
        Self {
            brand: brand.to_string(),
            url_keys: known.url_keys.into_iter().collect(),
            persisted: known.checksums.iter().cloned().collect(),
            checksums: known.checksums.into_iter().collect(),
        }
    }

    /// Admits a candidate unless its URL key is already known.
    ///
    /// A novel key is claimed immediately, so a second candidate with the
    /// same URL in this run is a duplicate.
    pub fn admit(&self, candidate: &CandidateArtifact) -> Admission {
        let key = Fingerprint::url_key(&self.brand, &candidate.artifact_url);
        if self.url_keys.insert(key.as_str().to_string()) {
            Admission::Novel(key)
        } else {
            Admission::Duplicate(key)
        }
    }

    /// Claims `checksum` unless it is already stored or claimed.
    pub fn check_content(&self, checksum: &Fingerprint) -> ContentCheck {
        if self.checksums.insert(checksum.as_str().to_string()) {
            ContentCheck::Novel
        } else {
            ContentCheck::Duplicate
        }
    }

    /// Gives up a checksum claim after a failed store, so another URL
    /// serving the same bytes may still ingest them.
    pub fn release(&self, checksum: &Fingerprint) {
        self.checksums.remove(checksum.as_str());
    }

    /// Marks both fingerprints as persisted.
    pub fn record_ingested(&self, url_key: &Fingerprint, checksum: &Fingerprint) {
        self.url_keys.insert(url_key.as_str().to_string());
        self.checksums.insert(checksum.as_str().to_string());
        self.persisted.insert(checksum.as_str().to_string());
    }

    /// Whether `checksum` was stored before this run or ingested during it.
    ///
    /// A claim alone does not count; the claiming worker may still fail.
    #[must_use]
    pub fn is_persisted(&self, checksum: &Fingerprint) -> bool {
        self.persisted.contains(checksum.as_str())
    }

    /// Brand this engine deduplicates for.
    #[must_use]
    pub fn brand(&self) -> &str {
        &self.brand
    }
}
