//! Error types for the object store and the metadata store.

use std::fmt;

use thiserror::Error;

/// Object store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing the object failed.
    #[error("failed to write object {path}: {source}")]
    WriteFailed {
        /// Storage location.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Checking for an existing object failed.
    #[error("failed to inspect object {path}: {source}")]
    ReadFailed {
        /// Storage location.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An object already exists at the path with different content.
    #[error("object {path} already exists with {existing_bytes} bytes (refusing {new_bytes} bytes)")]
    Conflict {
        /// Storage location.
        path: String,
        /// Size of the stored object.
        existing_bytes: u64,
        /// Size of the rejected write.
        new_bytes: u64,
    },

    /// The storage location escapes the store root or is empty.
    #[error("invalid storage location {path:?}")]
    InvalidPath {
        /// Rejected location.
        path: String,
    },
}

/// Classification of metadata store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Unique, check or not-null constraint failure.
    Constraint,
    /// The pool timed out waiting for a connection.
    PoolTimeout,
    /// The pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Anything else.
    Other,
}

impl MetadataErrorKind {
    /// Classifies a `sqlx` error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(db) => {
                let code = db.code();
                if matches!(
                    code.as_deref(),
                    Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
                ) || db.message().to_ascii_lowercase().contains("database is locked")
                {
                    Self::BusyOrLocked
                } else if db.is_unique_violation()
                    || db.is_check_violation()
                    || code
                        .as_deref()
                        .is_some_and(|c| c.starts_with("SQLITE_CONSTRAINT") || c == "2067")
                {
                    Self::Constraint
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for MetadataErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::Constraint => "constraint",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Metadata store failures.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// The upsert (or alias write) did not complete.
    #[error("metadata write failed ({kind}): {message}")]
    WriteFailed {
        /// Classification of the cause.
        kind: MetadataErrorKind,
        /// Driver message.
        message: String,
    },

    /// A schema constraint other than checksum uniqueness rejected the row.
    #[error("metadata constraint violated for checksum {checksum}: {message}")]
    ConstraintViolation {
        /// Checksum of the rejected record.
        checksum: String,
        /// Driver message.
        message: String,
    },

    /// Loading known fingerprints failed.
    #[error("metadata read failed ({kind}): {message}")]
    ReadFailed {
        /// Classification of the cause.
        kind: MetadataErrorKind,
        /// Driver message.
        message: String,
    },
}

impl MetadataError {
    /// Maps a failed write for the record with `checksum`.
    #[must_use]
    pub fn write(checksum: &str, error: &sqlx::Error) -> Self {
        match MetadataErrorKind::from_sqlx(error) {
            MetadataErrorKind::Constraint => Self::ConstraintViolation {
                checksum: checksum.to_string(),
                message: error.to_string(),
            },
            kind => Self::WriteFailed {
                kind,
                message: error.to_string(),
            },
        }
    }

    /// Maps a failed read.
    #[must_use]
    pub fn read(error: &sqlx::Error) -> Self {
        Self::ReadFailed {
            kind: MetadataErrorKind::from_sqlx(error),
            message: error.to_string(),
        }
    }

    /// True for transient contention worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed {
                kind: MetadataErrorKind::BusyOrLocked | MetadataErrorKind::PoolTimeout,
                ..
            } | Self::ReadFailed {
                kind: MetadataErrorKind::BusyOrLocked | MetadataErrorKind::PoolTimeout,
                ..
            }
        )
    }
}
