//! Persistence seams: the object store, the metadata store and the
//! fingerprint ledger.
//!
//! The pipeline only talks to [`PersistencePort`] and [`FingerprintLedger`];
//! [`LocalPersistence`] backs them with a directory and a `SQLite` database,
//! [`MemoryPersistence`] with in-process maps for tests and dry runs.

mod error;
mod fs;
mod local;
mod memory;
mod sqlite;

pub use error::{MetadataError, MetadataErrorKind, StorageError};
pub use fs::FsObjectStore;
pub use local::LocalPersistence;
pub use memory::MemoryPersistence;
pub use sqlite::SqliteMetadataStore;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable metadata row for one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRecord {
    /// Vendor brand.
    pub brand: String,
    /// Product or document title ("Manual" when unknown).
    pub product_name: String,
    /// Filesystem-safe file name.
    pub file_name: String,
    /// Content-addressed location in the object store.
    pub storage_location: String,
    /// Page or endpoint the artifact was found on.
    pub source_url: String,
    /// Normalized URL the bytes were downloaded from.
    pub artifact_url: String,
    /// Lowercase hex SHA-256 of the bytes.
    pub checksum: String,
    /// Size of the stored object.
    pub size_bytes: u64,
    /// When the record was created.
    pub inserted_at: DateTime<Utc>,
}

/// Result of [`PersistencePort::upsert_metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same checksum already existed; nothing changed.
    AlreadyPresent,
}

/// Fingerprints already persisted for one brand.
#[derive(Debug, Clone, Default)]
pub struct KnownFingerprints {
    /// URL keys of ingested artifacts and recorded aliases.
    pub url_keys: HashSet<String>,
    /// Checksums of stored artifacts (all brands).
    pub checksums: HashSet<String>,
}

/// Object and metadata writes used by ingestion.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Returns true when an object exists at `path`.
    async fn object_exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Stores `bytes` at `path`. Never overwrites an existing object.
    async fn put_object(&self, path: &str, bytes: &[u8], content_type: &str)
    -> Result<(), StorageError>;

    /// Inserts `record` unless one with the same checksum exists.
    async fn upsert_metadata(&self, record: &IngestionRecord)
    -> Result<UpsertOutcome, MetadataError>;
}

/// Persisted dedup state.
#[async_trait]
pub trait FingerprintLedger: Send + Sync {
    /// Loads known URL keys for `brand` and all known checksums.
    async fn load_known(&self, brand: &str) -> Result<KnownFingerprints, MetadataError>;

    /// Records that `url_key` resolved to content already stored as `checksum`.
    async fn record_alias(
        &self,
        brand: &str,
        url_key: &str,
        checksum: &str,
    ) -> Result<(), MetadataError>;
}

/// Builds the content-addressed storage location for an artifact.
///
/// Layout: `<brand-slug>/<checksum[0..2]>/<checksum>/<file-name>`.
#[must_use]
pub fn storage_location(brand_slug: &str, checksum: &str, file_name: &str) -> String {
    let shard = checksum.get(..2).unwrap_or(checksum);
    format!("{brand_slug}/{shard}/{checksum}/{file_name}")
}
