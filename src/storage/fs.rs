//! Directory-backed object store.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};

use super::StorageError;

/// Stores objects as files under a root directory.
///
/// Writes go to a temporary sibling first and are hard-linked into place,
/// which fails if the target exists. An existing object is never replaced,
/// and a crashed write never leaves a partial file at the final path.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root` (created lazily on first write).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage location to a path inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPath`] for empty or absolute locations
    /// and any containing `..`.
    pub fn resolve(&self, location: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(location);
        let valid = !location.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath {
                path: location.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Returns true when an object exists at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPath`] or [`StorageError::ReadFailed`].
    pub async fn exists(&self, location: &str) -> Result<bool, StorageError> {
        let path = self.resolve(location)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StorageError::ReadFailed {
                path: location.to_string(),
                source,
            })
    }

    /// Writes `bytes` at `location` unless an object is already there.
    ///
    /// Writing identical-length content to an existing location is a no-op;
    /// a different length is a [`StorageError::Conflict`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WriteFailed`] when the directory, temp file or
    /// link cannot be created.
    #[instrument(level = "debug", skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn put(&self, location: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(location)?;
        let write_failed = |source| StorageError::WriteFailed {
            path: location.to_string(),
            source,
        };

        if let Some(existing) = self.existing_len(location, &path).await? {
            return check_same(location, existing, bytes);
        }

        let Some(parent) = path.parent() else {
            return Err(StorageError::InvalidPath {
                path: location.to_string(),
            });
        };
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;

        let temp = parent.join(format!(".{:016x}.part", rand::random::<u64>()));
        tokio::fs::write(&temp, bytes).await.map_err(write_failed)?;

        let linked = tokio::fs::hard_link(&temp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            debug!(temp = %temp.display(), error = %e, "failed to remove temp file");
        }

        match linked {
            Ok(()) => {
                debug!(path = %path.display(), "object stored");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Lost a race with a concurrent writer of the same location.
                let existing = self.existing_len(location, &path).await?.unwrap_or(0);
                check_same(location, existing, bytes)
            }
            Err(e) => Err(write_failed(e)),
        }
    }

    async fn existing_len(&self, location: &str, path: &Path) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::ReadFailed {
                path: location.to_string(),
                source,
            }),
        }
    }
}

fn check_same(location: &str, existing: u64, bytes: &[u8]) -> Result<(), StorageError> {
    let new_bytes = bytes.len() as u64;
    if existing == new_bytes {
        debug!(location, "object already stored, skipping write");
        Ok(())
    } else {
        Err(StorageError::Conflict {
            path: location.to_string(),
            existing_bytes: existing,
            new_bytes,
        })
    }
}
