//! `SQLite` metadata store and fingerprint ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use super::{FingerprintLedger, IngestionRecord, KnownFingerprints, MetadataError, UpsertOutcome};
use crate::db::Database;
use crate::dedup::Fingerprint;

/// Metadata rows in the `artifacts` table, aliases in `url_aliases`.
///
/// Checksum uniqueness is enforced by the schema; an upsert of an existing
/// checksum changes nothing.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    db: Database,
}

impl SqliteMetadataStore {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts `record` unless its checksum is already present.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::WriteFailed`] for driver failures and
    /// [`MetadataError::ConstraintViolation`] when another constraint rejects
    /// the row.
    #[instrument(skip(self, record), fields(checksum = %record.checksum))]
    pub async fn upsert(&self, record: &IngestionRecord) -> Result<UpsertOutcome, MetadataError> {
        let size = i64::try_from(record.size_bytes).map_err(|_| {
            MetadataError::ConstraintViolation {
                checksum: record.checksum.clone(),
                message: format!("size {} exceeds storage range", record.size_bytes),
            }
        })?;
        let url_key = Fingerprint::url_key_str(&record.brand, &record.artifact_url);

        let result = sqlx::query(
            "INSERT INTO artifacts (brand, product_name, file_name, storage_location, \
             source_url, artifact_url, url_key, checksum, size_bytes, inserted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(checksum) DO NOTHING",
        )
        .bind(&record.brand)
        .bind(&record.product_name)
        .bind(&record.file_name)
        .bind(&record.storage_location)
        .bind(&record.source_url)
        .bind(&record.artifact_url)
        .bind(url_key.as_str())
        .bind(&record.checksum)
        .bind(size)
        .bind(record.inserted_at.to_rfc3339())
        .execute(self.db.pool())
        .await
        .map_err(|e| MetadataError::write(&record.checksum, &e))?;

        let outcome = if result.rows_affected() == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::AlreadyPresent
        };
        debug!(?outcome, "metadata upserted");
        Ok(outcome)
    }

    /// Returns the records stored for `brand`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::ReadFailed`] if the query fails.
    pub async fn records_for_brand(&self, brand: &str) -> Result<Vec<IngestionRecord>, MetadataError> {
        let rows = sqlx::query(
            "SELECT brand, product_name, file_name, storage_location, source_url, \
             artifact_url, checksum, size_bytes, inserted_at \
             FROM artifacts WHERE brand = ? ORDER BY id",
        )
        .bind(brand)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| MetadataError::read(&e))?;

        rows.iter()
            .map(|row| {
                let size: i64 = row.try_get("size_bytes")?;
                let inserted_at: String = row.try_get("inserted_at")?;
                Ok(IngestionRecord {
                    brand: row.try_get("brand")?,
                    product_name: row.try_get("product_name")?,
                    file_name: row.try_get("file_name")?,
                    storage_location: row.try_get("storage_location")?,
                    source_url: row.try_get("source_url")?,
                    artifact_url: row.try_get("artifact_url")?,
                    checksum: row.try_get("checksum")?,
                    size_bytes: u64::try_from(size).unwrap_or_default(),
                    inserted_at: DateTime::parse_from_rfc3339(&inserted_at)
                        .map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc)),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| MetadataError::read(&e))
    }
}

#[async_trait]
impl FingerprintLedger for SqliteMetadataStore {
    #[instrument(skip(self))]
    async fn load_known(&self, brand: &str) -> Result<KnownFingerprints, MetadataError> {
        let pool = self.db.pool();
        let mut known = KnownFingerprints::default();

        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT url_key FROM artifacts WHERE brand = ?1 \
             UNION SELECT url_key FROM url_aliases WHERE brand = ?1",
        )
        .bind(brand)
        .fetch_all(pool)
        .await
        .map_err(|e| MetadataError::read(&e))?;
        known.url_keys.extend(keys.into_iter().map(|(k,)| k));

        let sums: Vec<(String,)> = sqlx::query_as("SELECT checksum FROM artifacts")
            .fetch_all(pool)
            .await
            .map_err(|e| MetadataError::read(&e))?;
        known.checksums.extend(sums.into_iter().map(|(c,)| c));

        Ok(known)
    }

    async fn record_alias(
        &self,
        brand: &str,
        url_key: &str,
        checksum: &str,
    ) -> Result<(), MetadataError> {
        sqlx::query(
            "INSERT INTO url_aliases (url_key, brand, checksum) VALUES (?, ?, ?) \
             ON CONFLICT(url_key) DO NOTHING",
        )
        .bind(url_key)
        .bind(brand)
        .bind(checksum)
        .execute(self.db.pool())
        .await
        .map_err(|e| MetadataError::write(checksum, &e))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(Database::open_in_memory().await.unwrap())
    }

    fn record(checksum_seed: &[u8], url: &str) -> IngestionRecord {
        let checksum = Fingerprint::checksum(checksum_seed).as_str().to_string();
        IngestionRecord {
            brand: "Acme".to_string(),
            product_name: "Model 1".to_string(),
            file_name: "m1.pdf".to_string(),
            storage_location: format!("acme/{}/{checksum}/m1.pdf", &checksum[..2]),
            source_url: "https://acme.example/support".to_string(),
            artifact_url: url.to_string(),
            checksum,
            size_bytes: 42,
            inserted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_noops() {
        let store = store().await;
        let first = record(b"one", "https://acme.example/m1.pdf");
        assert_eq!(store.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);

        let mut again = record(b"one", "https://acme.example/mirror/m1.pdf");
        again.product_name = "Renamed".to_string();
        assert_eq!(store.upsert(&again).await.unwrap(), UpsertOutcome::AlreadyPresent);

        let rows = store.records_for_brand("Acme").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].product_name, "Model 1");
        assert_eq!(rows[0].artifact_url, "https://acme.example/m1.pdf");
        assert_eq!(rows[0].size_bytes, 42);
    }

    #[tokio::test]
    async fn test_bad_checksum_is_constraint_violation() {
        let store = store().await;
        let mut bad = record(b"x", "https://acme.example/x.pdf");
        bad.checksum = "short".to_string();
        assert!(matches!(
            store.upsert(&bad).await,
            Err(MetadataError::ConstraintViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_known_includes_records_and_aliases() {
        let store = store().await;
        let stored = record(b"one", "https://acme.example/m1.pdf");
        store.upsert(&stored).await.unwrap();
        let alias_key = Fingerprint::url_key_str("Acme", "https://acme.example/copy.pdf");
        store
            .record_alias("Acme", alias_key.as_str(), &stored.checksum)
            .await
            .unwrap();
        // Aliases are idempotent.
        store
            .record_alias("Acme", alias_key.as_str(), &stored.checksum)
            .await
            .unwrap();

        let known = store.load_known("Acme").await.unwrap();
        assert!(known.url_keys.contains(
            Fingerprint::url_key_str("Acme", "https://acme.example/m1.pdf").as_str()
        ));
        assert!(known.url_keys.contains(alias_key.as_str()));
        assert!(known.checksums.contains(&stored.checksum));

        let other = store.load_known("Other").await.unwrap();
        assert!(other.url_keys.is_empty());
        assert_eq!(other.checksums.len(), 1);
    }
}
