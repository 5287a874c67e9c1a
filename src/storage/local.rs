//! Durable local backend: files on disk plus a `SQLite` metadata database.

use std::path::Path;

use async_trait::async_trait;
use tracing::instrument;

use super::{
    FingerprintLedger, FsObjectStore, IngestionRecord, KnownFingerprints, MetadataError,
    PersistencePort, SqliteMetadataStore, StorageError, UpsertOutcome,
};
use crate::db::{Database, DbError};

/// [`FsObjectStore`] and [`SqliteMetadataStore`] behind the persistence seams.
#[derive(Debug, Clone)]
pub struct LocalPersistence {
    objects: FsObjectStore,
    metadata: SqliteMetadataStore,
}

impl LocalPersistence {
    /// Combines an object store and a metadata store.
    #[must_use]
    pub fn new(objects: FsObjectStore, metadata: SqliteMetadataStore) -> Self {
        Self { objects, metadata }
    }

    /// Opens the store directory and database file.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the database cannot be opened or migrated.
    #[instrument(fields(store = %store_dir.display(), db = %db_path.display()))]
    pub async fn open(store_dir: &Path, db_path: &Path) -> Result<Self, DbError> {
        let db = Database::open(db_path).await?;
        Ok(Self::new(
            FsObjectStore::new(store_dir),
            SqliteMetadataStore::new(db),
        ))
    }

    /// Object store half.
    #[must_use]
    pub fn objects(&self) -> &FsObjectStore {
        &self.objects
    }

    /// Metadata store half.
    #[must_use]
    pub fn metadata(&self) -> &SqliteMetadataStore {
        &self.metadata
    }
}

#[async_trait]
impl PersistencePort for LocalPersistence {
    async fn object_exists(&self, path: &str) -> Result<bool, StorageError> {
        self.objects.exists(path).await
    }

    async fn put_object(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects.put(path, bytes).await
    }

    async fn upsert_metadata(
        &self,
        record: &IngestionRecord,
    ) -> Result<UpsertOutcome, MetadataError> {
        self.metadata.upsert(record).await
    }
}

#[async_trait]
impl FingerprintLedger for LocalPersistence {
    async fn load_known(&self, brand: &str) -> Result<KnownFingerprints, MetadataError> {
        self.metadata.load_known(brand).await
    }

    async fn record_alias(
        &self,
        brand: &str,
        url_key: &str,
        checksum: &str,
    ) -> Result<(), MetadataError> {
        self.metadata.record_alias(brand, url_key, checksum).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    use crate::dedup::Fingerprint;
    use crate::storage::storage_location;

    #[tokio::test]
    async fn test_round_trip_through_local_backend() {
        let dir = TempDir::new().unwrap();
        let store = LocalPersistence::open(&dir.path().join("store"), &dir.path().join("h.db"))
            .await
            .unwrap();

        let bytes = b"%PDF-1.7 manual";
        let checksum = Fingerprint::checksum(bytes).as_str().to_string();
        let location = storage_location("acme", &checksum, "m1.pdf");

        assert!(!store.object_exists(&location).await.unwrap());
        store.put_object(&location, bytes, "application/pdf").await.unwrap();
        assert!(store.object_exists(&location).await.unwrap());
        assert!(store.objects().root().join(&location).is_file());

        let record = IngestionRecord {
            brand: "Acme".to_string(),
            product_name: "Model 1".to_string(),
            file_name: "m1.pdf".to_string(),
            storage_location: location,
            source_url: "https://acme.example/support".to_string(),
            artifact_url: "https://acme.example/m1.pdf".to_string(),
            checksum: checksum.clone(),
            size_bytes: bytes.len() as u64,
            inserted_at: Utc::now(),
        };
        assert_eq!(store.upsert_metadata(&record).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(
            store.upsert_metadata(&record).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );

        let known = store.load_known("Acme").await.unwrap();
        assert!(known.checksums.contains(&checksum));
        assert_eq!(store.metadata().records_for_brand("Acme").await.unwrap().len(), 1);
    }
}
