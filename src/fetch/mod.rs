//! Fetch strategies: one network fetch per traversal node.
//!
//! # Architecture
//!
//! - [`FetchStrategy`] - async trait every variant implements
//! - [`StaticStrategy`] - plain HTTP GET of server-rendered markup
//! - [`ApiStrategy`] - structured GET/POST against a vendor JSON endpoint
//! - [`RenderedStrategy`] - headless browser session for script-built pages
//! - [`build_strategy`] - selects the variant from a [`SourceConfig`]
//!
//! All variants fail with [`FetchError`], so the traversal engine never
//! branches on which strategy it holds.

mod api;
mod error;
mod rendered;
mod static_page;

pub use api::ApiStrategy;
pub use error::FetchError;
pub use rendered::{RenderOptions, RenderedStrategy, WaitCondition};
pub use static_page::StaticStrategy;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::{ConfigError, FetchStrategyKind, PipelineSettings, SourceConfig};
use crate::http_client::build_http_client;

/// A JSON response observed in the background of a rendered page session.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// URL the page requested.
    pub url: String,
    /// Parsed JSON body.
    pub payload: Value,
}

/// Raw content returned by one fetch, before classification.
#[derive(Debug, Clone)]
pub enum RawContent {
    /// Server-provided HTML.
    Markup {
        /// Final URL, used as the resolution base.
        url: Url,
        /// Response body.
        html: String,
    },
    /// Parsed JSON payload from an API endpoint.
    Structured {
        /// Target URL, used as the resolution base.
        url: Url,
        /// Decoded JSON value.
        payload: Value,
    },
    /// DOM realized by a browser, plus background API responses.
    Rendered {
        /// Page URL after navigation.
        url: Url,
        /// Serialized DOM.
        html: String,
        /// JSON responses captured while the page loaded.
        captured: Vec<CapturedResponse>,
    },
}

impl RawContent {
    /// Returns the URL relative references resolve against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        match self {
            Self::Markup { url, .. } | Self::Structured { url, .. } | Self::Rendered { url, .. } => {
                url
            }
        }
    }
}

/// Performs one fetch of a traversal target.
///
/// Strategy parameters are bound at construction from the source's
/// `strategyParams`, so `fetch` only takes the target.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Which variant this is (for logging only).
    fn kind(&self) -> FetchStrategyKind;

    /// Fetches `target` and returns its raw content.
    async fn fetch(&self, target: &Url) -> Result<RawContent, FetchError>;
}

/// Builds the strategy configured for `config`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when the strategy parameters are unusable
/// or no HTTP client can be built.
pub fn build_strategy(
    config: &SourceConfig,
    settings: &PipelineSettings,
) -> Result<Box<dyn FetchStrategy>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        origin: config.brand.clone(),
        reason,
    };
    let params = &config.strategy_params;
    let headers = parse_headers(params);

    debug!(
        brand = %config.brand,
        kind = %config.fetch_strategy_kind,
        "building fetch strategy"
    );

    match config.fetch_strategy_kind {
        FetchStrategyKind::Static => {
            let client = build_http_client(settings.fetch_timeout)
                .map_err(|e| invalid(e.to_string()))?;
            Ok(Box::new(StaticStrategy::new(client, headers)))
        }
        FetchStrategyKind::Api => {
            let client = build_http_client(settings.fetch_timeout)
                .map_err(|e| invalid(e.to_string()))?;
            let strategy = ApiStrategy::from_params(client, params).map_err(invalid)?;
            Ok(Box::new(strategy))
        }
        FetchStrategyKind::Rendered => {
            let mut options = RenderOptions::from_params(params).map_err(invalid)?;
            if options.timeout.is_none() {
                options.timeout = Some(settings.fetch_timeout.max(Duration::from_secs(30)));
            }
            Ok(Box::new(RenderedStrategy::new(options)))
        }
    }
}

/// Reads the optional `headers` object of string values.
pub(crate) fn parse_headers(params: &Map<String, Value>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(Value::Object(entries)) = params.get("headers") else {
        return headers;
    };
    for (name, value) in entries {
        let Some(value) = value.as_str() else {
            warn!(header = %name, "ignoring non-string header value");
            continue;
        };
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "ignoring invalid header"),
        }
    }
    headers
}

/// Returns true when a `Content-Type` value denotes JSON.
pub(crate) fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("application/json") || ct.contains("+json") || ct.contains("text/json")
    })
}
