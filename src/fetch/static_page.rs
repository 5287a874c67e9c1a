//! Plain HTTP GET of server-rendered vendor pages.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::{debug, instrument};
use url::Url;

use super::{FetchError, FetchStrategy, RawContent, is_json_content_type};
use crate::config::FetchStrategyKind;

const ACCEPT_MARKUP: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

/// Fetches a page with a single GET.
///
/// A JSON response is handed back as [`RawContent::Structured`] so static
/// sources that link straight to a listing endpoint still extract.
#[derive(Debug, Clone)]
pub struct StaticStrategy {
    client: Client,
    headers: HeaderMap,
}

impl StaticStrategy {
    /// Creates a strategy sending `headers` on every request.
    #[must_use]
    pub fn new(client: Client, headers: HeaderMap) -> Self {
        Self { client, headers }
    }
}

#[async_trait]
impl FetchStrategy for StaticStrategy {
    fn kind(&self) -> FetchStrategyKind {
        FetchStrategyKind::Static
    }

    #[instrument(level = "debug", skip(self), fields(url = %target))]
    async fn fetch(&self, target: &Url) -> Result<RawContent, FetchError> {
        let response = self
            .client
            .get(target.clone())
            .header(ACCEPT, HeaderValue::from_static(ACCEPT_MARKUP))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(target.as_str(), &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(target.as_str(), status.as_u16()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(target.as_str(), &e))?;

        debug!(
            status = status.as_u16(),
            bytes = body.len(),
            content_type = content_type.as_deref().unwrap_or("-"),
            "page fetched"
        );

        if is_json_content_type(content_type.as_deref()) {
            let payload = serde_json::from_str(&body).map_err(|e| {
                FetchError::network(target.as_str(), format!("invalid JSON body: {e}"))
            })?;
            return Ok(RawContent::Structured {
                url: final_url,
                payload,
            });
        }

        Ok(RawContent::Markup {
            url: final_url,
            html: body,
        })
    }
}
