//! Error taxonomy shared by every fetch strategy.
//!
//! The traversal engine treats all three variants the same way (log, count,
//! move on), so strategies only need to pick the closest kind.

use thiserror::Error;

/// A single page, API, or rendered fetch failed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure, non-2xx response, or unreadable body.
    #[error("network error fetching {url}: {reason}")]
    Network {
        /// Target that failed.
        url: String,
        /// Human-readable cause.
        reason: String,
        /// HTTP status when the server answered.
        status: Option<u16>,
    },

    /// The fetch did not complete within its bounded timeout.
    #[error("timeout fetching {url}")]
    Timeout {
        /// Target that timed out.
        url: String,
    },

    /// The vendor refused the crawler (auth wall, bot detection, rate limit).
    #[error("blocked fetching {url} (HTTP {status})")]
    Blocked {
        /// Target that was refused.
        url: String,
        /// HTTP status returned.
        status: u16,
    },
}

impl FetchError {
    /// Creates a network error with a free-form reason.
    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
            status: None,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Maps a non-success HTTP status.
    ///
    /// 401, 403, 429 and 451 mean the crawler was refused and become
    /// [`FetchError::Blocked`]; everything else is [`FetchError::Network`].
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        if matches!(status, 401 | 403 | 429 | 451) {
            Self::Blocked { url, status }
        } else {
            Self::Network {
                url,
                reason: format!("HTTP {status}"),
                status: Some(status),
            }
        }
    }

    /// Maps a `reqwest` transport error, separating timeouts.
    pub fn from_reqwest(url: impl Into<String>, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, error)
        }
    }

    /// Short label for logs and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::Blocked { .. } => "blocked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classifies_refusals_as_blocked() {
        for status in [401, 403, 429, 451] {
            let error = FetchError::from_status("https://x/a", status);
            assert!(matches!(error, FetchError::Blocked { .. }), "{status}");
            assert_eq!(error.kind(), "blocked");
        }
    }

    #[test]
    fn test_from_status_server_error_is_network() {
        let error = FetchError::from_status("https://x/a", 500);
        assert!(matches!(
            error,
            FetchError::Network {
                status: Some(500),
                ..
            }
        ));
        assert!(error.to_string().contains("HTTP 500"));
    }

    #[test]
    fn test_timeout_display() {
        let error = FetchError::timeout("https://x/slow");
        assert_eq!(error.kind(), "timeout");
        assert!(error.to_string().contains("https://x/slow"));
    }
}
