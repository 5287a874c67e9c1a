//! Shared `reqwest` client construction for page fetches and downloads.
//!
//! Every client carries the crawler's identifying User-Agent, gzip support
//! and explicit connect/overall timeouts. Some sandboxed environments panic
//! while reading system proxy settings; the builder then falls back to
//! `*_PROXY` environment variables only.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy};
use tracing::warn;

use crate::user_agent;

/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error raised when no HTTP client could be built.
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    /// `reqwest` rejected the builder configuration.
    #[error("HTTP client construction failed: {0}")]
    Build(#[from] reqwest::Error),

    /// Proxy lookup panicked even with the env-proxy fallback.
    #[error("HTTP client construction panicked while reading proxy settings")]
    Panicked,
}

/// Builds a client whose requests time out after `timeout`.
///
/// # Errors
///
/// Returns [`ClientBuildError`] if neither the default nor the env-proxy
/// fallback builder succeeds.
pub fn build_http_client(timeout: Duration) -> Result<Client, ClientBuildError> {
    match try_build(timeout, false) {
        Ok(client) => Ok(client),
        Err(BuildFailure::Panic) => {
            warn!("HTTP client builder panicked reading system proxy settings; using env-proxy fallback");
            match try_build(timeout, true) {
                Ok(client) => Ok(client),
                Err(BuildFailure::Panic) => Err(ClientBuildError::Panicked),
                Err(BuildFailure::Build(e)) => Err(ClientBuildError::Build(e)),
            }
        }
        Err(BuildFailure::Build(e)) => Err(ClientBuildError::Build(e)),
    }
}

enum BuildFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build(timeout: Duration, env_proxy_only: bool) -> Result<Client, BuildFailure> {
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(timeout);
        if env_proxy_only {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildFailure::Build)
    }))
    .map_err(|_| BuildFailure::Panic)?
}

fn base_builder(timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .gzip(true)
        .user_agent(user_agent::default_user_agent())
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = first_env(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = first_env(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
