//! Byte-level artifact downloads.

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tracing::{debug, instrument};
use url::Url;

use super::DownloadError;
use crate::url_norm::is_http;

/// Largest artifact accepted (512 MiB).
pub const MAX_ARTIFACT_BYTES: u64 = 512 * 1024 * 1024;

/// A fully buffered artifact body.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    /// Body bytes.
    pub bytes: Vec<u8>,
    /// `Content-Type` header, when sent.
    pub content_type: Option<String>,
    /// URL after redirects.
    pub final_url: Url,
}

impl DownloadedArtifact {
    /// Content type to store the object with.
    #[must_use]
    pub fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// Downloads artifact bodies into memory so they can be checksummed before
/// anything is written.
#[derive(Debug, Clone)]
pub struct ArtifactClient {
    client: Client,
    max_bytes: u64,
}

impl ArtifactClient {
    /// Wraps a client built by [`crate::http_client::build_http_client`].
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_bytes: MAX_ARTIFACT_BYTES,
        }
    }

    /// Overrides the body size limit.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Performs one GET of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] (with any `Retry-After`) for a
    /// non-2xx response, [`DownloadError::TooLarge`] past the size limit, and
    /// [`DownloadError::Network`] / [`DownloadError::Timeout`] for transport
    /// failures, including ones mid-body.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn download(&self, url: &Url) -> Result<DownloadedArtifact, DownloadError> {
        if !is_http(url) {
            return Err(DownloadError::invalid_url(url.as_str()));
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(DownloadError::http_status(
                url.as_str(),
                status.as_u16(),
                retry_after,
            ));
        }

        if let Some(length) = response.content_length()
            && length > self.max_bytes
        {
            return Err(DownloadError::TooLarge {
                url: url.to_string(),
                limit: self.max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let final_url = response.url().clone();

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::from_reqwest(url.as_str(), e))?;
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(bytes = bytes.len(), content_type = ?content_type, "artifact downloaded");
        Ok(DownloadedArtifact {
            bytes,
            content_type,
            final_url,
        })
    }
}
