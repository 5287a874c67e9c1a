//! Stable identities for documents.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

/// Identity of a logical document.
///
/// Two candidates with the same fingerprint are the same document. A
/// [`Fingerprint::UrlKey`] is known before download; a
/// [`Fingerprint::Checksum`] only after the bytes are in hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Fingerprint {
    /// SHA-256 over the brand and normalized artifact URL.
    UrlKey(String),
    /// SHA-256 over the artifact bytes.
    Checksum(String),
}

impl Fingerprint {
    /// URL key for an already-normalized artifact URL.
    #[must_use]
    pub fn url_key(brand: &str, url: &Url) -> Self {
        Self::url_key_str(brand, url.as_str())
    }

    /// URL key for a normalized URL held as a string (persisted records).
    #[must_use]
    pub fn url_key_str(brand: &str, url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(brand.as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        Self::UrlKey(hex::encode(hasher.finalize()))
    }

    /// Content checksum of `bytes`.
    #[must_use]
    pub fn checksum(bytes: &[u8]) -> Self {
        Self::Checksum(hex::encode(Sha256::digest(bytes)))
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::UrlKey(v) | Self::Checksum(v) => v,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UrlKey(v) => write!(f, "url:{v}"),
            Self::Checksum(v) => write!(f, "sha256:{v}"),
        }
    }
}
