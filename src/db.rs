//! `SQLite` connection setup for the metadata store.
//!
//! File databases run in WAL mode with a busy timeout so concurrent
//! ingestion workers can write without immediate lock errors. The schema is
//! embedded from `migrations/` and applied on open.
//!
//! ```no_run
//! use harvester_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(Path::new("harvester.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Kept low; `SQLite` serializes writers anyway.
const MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Database setup errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening the database failed.
    #[error("failed to open metadata database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Applying the schema failed.
    #[error("failed to apply metadata schema: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pooled handle to the metadata database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the file cannot be opened and
    /// [`DbError::Migration`] if the schema cannot be applied.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("metadata database ready");

        Ok(Self { pool })
    }

    /// Opens a private in-memory database (tests, dry runs).
    ///
    /// A single connection keeps every query on the same in-memory database.
    ///
    /// # Errors
    ///
    /// Same as [`Database::open`].
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns true when the journal mode is WAL.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma query fails.
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_has_tables() {
        let db = Database::open_in_memory().await.unwrap();
        for table in ["artifacts", "url_aliases"] {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_one(db.pool())
                    .await
                    .unwrap();
            assert_eq!(count, 1, "{table} missing");
        }
    }

    #[tokio::test]
    async fn test_checksum_column_is_unique() {
        let db = Database::open_in_memory().await.unwrap();
        let checksum = "a".repeat(64);
        let insert = "INSERT INTO artifacts (brand, file_name, storage_location, source_url, \
                      artifact_url, url_key, checksum, size_bytes, inserted_at) \
                      VALUES ('Acme', 'm.pdf', 'acme/aa/x/m.pdf', 'https://a/', 'https://a/m.pdf', 'k', ?, 1, '2026-01-01T00:00:00Z')";
        sqlx::query(insert).bind(&checksum).execute(db.pool()).await.unwrap();
        assert!(sqlx::query(insert).bind(&checksum).execute(db.pool()).await.is_err());
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("meta.db")).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
        db.close().await;
    }
}
