//! In-process persistence for tests and dry runs.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{
    FingerprintLedger, IngestionRecord, KnownFingerprints, MetadataError, PersistencePort,
    StorageError, UpsertOutcome,
};
use crate::dedup::Fingerprint;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

#[derive(Debug, Clone)]
struct Alias {
    brand: String,
    checksum: String,
}

/// Object store, metadata store and ledger backed by maps.
///
/// Follows the same rules as the durable backend: objects are never
/// overwritten and metadata is unique by checksum. Writes to locations
/// containing a registered substring fail, for exercising error paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    objects: RwLock<HashMap<String, StoredObject>>,
    records: RwLock<HashMap<String, IngestionRecord>>,
    aliases: RwLock<HashMap<String, Alias>>,
    failing_paths: RwLock<Vec<String>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `put_object` whose location contains `fragment` fail.
    pub fn fail_writes_matching(&self, fragment: impl Into<String>) {
        self.failing_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fragment.into());
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Bytes and content type stored at `path`.
    #[must_use]
    pub fn object(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|o| (o.bytes.clone(), o.content_type.clone()))
    }

    /// All metadata records, ordered by storage location.
    #[must_use]
    pub fn records(&self) -> Vec<IngestionRecord> {
        let mut records: Vec<IngestionRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.storage_location.cmp(&b.storage_location));
        records
    }

    /// Number of recorded URL aliases.
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl PersistencePort for MemoryPersistence {
    async fn object_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path))
    }

    async fn put_object(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let failing = self
            .failing_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|fragment| path.contains(fragment.as_str()));
        if failing {
            return Err(StorageError::WriteFailed {
                path: path.to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = objects.get(path) {
            if existing.bytes.len() == bytes.len() {
                return Ok(());
            }
            return Err(StorageError::Conflict {
                path: path.to_string(),
                existing_bytes: existing.bytes.len() as u64,
                new_bytes: bytes.len() as u64,
            });
        }
        objects.insert(
            path.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn upsert_metadata(
        &self,
        record: &IngestionRecord,
    ) -> Result<UpsertOutcome, MetadataError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.checksum) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        records.insert(record.checksum.clone(), record.clone());
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl FingerprintLedger for MemoryPersistence {
    async fn load_known(&self, brand: &str) -> Result<KnownFingerprints, MetadataError> {
        let mut known = KnownFingerprints::default();
        for record in self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            known.checksums.insert(record.checksum.clone());
            if record.brand == brand {
                let key = Fingerprint::url_key_str(&record.brand, &record.artifact_url);
                known.url_keys.insert(key.as_str().to_string());
            }
        }
        for (url_key, alias) in self.aliases.read().unwrap_or_else(PoisonError::into_inner).iter() {
            if alias.brand == brand {
                known.url_keys.insert(url_key.clone());
                known.checksums.insert(alias.checksum.clone());
            }
        }
        Ok(known)
    }

    async fn record_alias(
        &self,
        brand: &str,
        url_key: &str,
        checksum: &str,
    ) -> Result<(), MetadataError> {
        self.aliases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url_key.to_string())
            .or_insert_with(|| Alias {
                brand: brand.to_string(),
                checksum: checksum.to_string(),
            });
        Ok(())
    }
}
