//! Artifact download errors.

use thiserror::Error;

/// One download attempt failed.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport failure (DNS, refused connection, TLS, truncated body).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// Artifact URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The download did not finish within its timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// Artifact URL.
        url: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// Artifact URL.
        url: String,
        /// Status code.
        status: u16,
        /// Raw `Retry-After` header, if sent.
        retry_after: Option<String>,
    },

    /// The URL cannot be downloaded (non-HTTP scheme).
    #[error("invalid artifact URL: {url}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
    },

    /// The body exceeded the size limit.
    #[error("artifact {url} exceeds {limit} bytes")]
    TooLarge {
        /// Artifact URL.
        url: String,
        /// Limit in bytes.
        limit: u64,
    },
}

impl DownloadError {
    /// Wraps a `reqwest` error, separating timeouts.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a status error, optionally carrying `Retry-After`.
    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an invalid-URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// The raw `Retry-After` value, for 429 handling.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
