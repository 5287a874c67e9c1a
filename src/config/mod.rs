//! Per-vendor source configuration and run settings.
//!
//! Each vendor is described by one JSON document:
//!
//! ```json
//! {
//!   "brand": "Acme",
//!   "entryPoints": ["https://acme.example/support/downloads"],
//!   "traversalDepthLimit": 2,
//!   "domainAllowList": ["acme.example"],
//!   "artifactPattern": ".pdf",
//!   "fetchStrategyKind": "static",
//!   "strategyParams": {}
//! }
//! ```
//!
//! A [`SourceConfig`] is read once at pipeline start and never mutated.

mod pattern;

pub use pattern::{ArtifactPattern, DEFAULT_ARTIFACT_PATTERN};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::ingest::RetryPolicy;
use crate::url_norm::normalize_url;

/// Default number of hops followed from an entry point.
pub const DEFAULT_TRAVERSAL_DEPTH_LIMIT: u32 = 3;

/// Default number of concurrent artifact downloads per source.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

/// Upper bound on download concurrency, to respect vendor rate limits.
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 16;

/// Default minimum delay between requests to the same host (milliseconds).
pub const DEFAULT_POLITENESS_DELAY_MS: u64 = 500;

/// Default timeout for a single page or API fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Default timeout for a single artifact download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised while loading or validating source configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a config file or directory failed.
    #[error("IO error reading config {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON or has wrongly-typed fields.
    #[error("malformed config {origin}: {source}")]
    Parse {
        /// File path or other origin label.
        origin: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value the pipeline cannot run with.
    #[error("invalid config {origin}: {reason}")]
    Invalid {
        /// File path or other origin label.
        origin: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The artifact pattern looked like a regex but did not compile.
    #[error("invalid artifact pattern {pattern:?}: {source}")]
    Pattern {
        /// Configured pattern string.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// The config directory contains no `*.json` files.
    #[error("no source configs (*.json) found in {}", dir.display())]
    NoConfigs {
        /// Directory that was scanned.
        dir: PathBuf,
    },
}

impl ConfigError {
    fn invalid(origin: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            origin: origin.to_string(),
            reason: reason.into(),
        }
    }
}

/// How pages for a source are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategyKind {
    /// Plain HTTP GET of server-rendered markup.
    #[default]
    #[serde(alias = "Static", alias = "STATIC")]
    Static,
    /// Structured request against a vendor JSON endpoint.
    #[serde(alias = "Api", alias = "API")]
    Api,
    /// Headless browser session for script-rendered pages.
    #[serde(alias = "Rendered", alias = "RENDERED")]
    Rendered,
}

impl FetchStrategyKind {
    /// Returns the lowercase configuration name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Api => "api",
            Self::Rendered => "rendered",
        }
    }
}

impl fmt::Display for FetchStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FetchStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "api" => Ok(Self::Api),
            "rendered" => Ok(Self::Rendered),
            other => Err(format!("unknown fetch strategy kind: {other}")),
        }
    }
}

/// On-disk shape of a source config, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceConfig {
    brand: String,
    #[serde(default)]
    entry_points: Vec<String>,
    #[serde(default = "default_depth_limit")]
    traversal_depth_limit: u32,
    #[serde(default)]
    domain_allow_list: Vec<String>,
    #[serde(default)]
    artifact_pattern: Option<String>,
    #[serde(default)]
    fetch_strategy_kind: FetchStrategyKind,
    #[serde(default)]
    strategy_params: Map<String, Value>,
}

fn default_depth_limit() -> u32 {
    DEFAULT_TRAVERSAL_DEPTH_LIMIT
}

/// Validated configuration for one vendor source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Vendor brand name, used for record ownership and storage paths.
    pub brand: String,
    /// Normalized traversal seeds, in configured order.
    pub entry_points: Vec<Url>,
    /// Maximum hops from any entry point.
    pub traversal_depth_limit: u32,
    /// Lowercase host substrings that may be traversed.
    pub domain_allow_list: Vec<String>,
    /// Matcher deciding which references are artifacts.
    pub artifact_pattern: ArtifactPattern,
    /// Fetch mechanism for this source.
    pub fetch_strategy_kind: FetchStrategyKind,
    /// Opaque, strategy-specific parameters.
    pub strategy_params: Map<String, Value>,
}

impl SourceConfig {
    /// Creates a static-fetch config with default limits.
    ///
    /// The allow-list defaults to the hosts of `entry_points`.
    #[must_use]
    pub fn new(brand: impl Into<String>, entry_points: Vec<Url>) -> Self {
        let entry_points: Vec<Url> = entry_points.iter().map(normalize_url).collect();
        let domain_allow_list = hosts_of(&entry_points);
        Self {
            brand: brand.into(),
            entry_points,
            traversal_depth_limit: DEFAULT_TRAVERSAL_DEPTH_LIMIT,
            domain_allow_list,
            artifact_pattern: ArtifactPattern::default(),
            fetch_strategy_kind: FetchStrategyKind::Static,
            strategy_params: Map::new(),
        }
    }

    /// Overrides the traversal depth limit.
    #[must_use]
    pub fn with_depth_limit(mut self, limit: u32) -> Self {
        self.traversal_depth_limit = limit;
        self
    }

    /// Overrides the domain allow-list.
    #[must_use]
    pub fn with_allow_list<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.domain_allow_list = domains
            .into_iter()
            .map(|d| d.as_ref().trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    /// Overrides the artifact pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: ArtifactPattern) -> Self {
        self.artifact_pattern = pattern;
        self
    }

    /// Overrides the fetch strategy and its parameters.
    #[must_use]
    pub fn with_strategy(mut self, kind: FetchStrategyKind, params: Map<String, Value>) -> Self {
        self.fetch_strategy_kind = kind;
        self.strategy_params = params;
        self
    }

    /// Parses and validates a config from a JSON string.
    ///
    /// `origin` labels errors (usually the file path).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON, [`ConfigError::Invalid`]
    /// for missing brand/entry points or bad URLs, and [`ConfigError::Pattern`]
    /// for a regex pattern that fails to compile.
    pub fn from_json_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let parsed: RawSourceConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?;
        Self::from_raw(parsed, origin)
    }

    fn from_raw(raw: RawSourceConfig, origin: &str) -> Result<Self, ConfigError> {
        let brand = raw.brand.trim().to_string();
        if brand.is_empty() {
            return Err(ConfigError::invalid(origin, "`brand` must not be empty"));
        }
        if raw.entry_points.is_empty() {
            return Err(ConfigError::invalid(
                origin,
                "`entryPoints` must list at least one URL",
            ));
        }

        let mut entry_points = Vec::with_capacity(raw.entry_points.len());
        for entry in &raw.entry_points {
            let parsed = Url::parse(entry.trim()).map_err(|e| {
                ConfigError::invalid(origin, format!("entry point {entry:?} is not a URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::invalid(
                    origin,
                    format!("entry point {entry:?} must use http or https"),
                ));
            }
            entry_points.push(normalize_url(&parsed));
        }

        let pattern_raw = raw
            .artifact_pattern
            .unwrap_or_else(|| DEFAULT_ARTIFACT_PATTERN.to_string());
        let artifact_pattern =
            ArtifactPattern::parse(&pattern_raw).map_err(|source| ConfigError::Pattern {
                pattern: pattern_raw.clone(),
                source,
            })?;

        let mut domain_allow_list: Vec<String> = raw
            .domain_allow_list
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if domain_allow_list.is_empty() {
            domain_allow_list = hosts_of(&entry_points);
            debug!(
                brand = %brand,
                allow_list = ?domain_allow_list,
                "domain allow-list defaulted to entry point hosts"
            );
        }

        Ok(Self {
            brand,
            entry_points,
            traversal_depth_limit: raw.traversal_depth_limit,
            domain_allow_list,
            artifact_pattern,
            fetch_strategy_kind: raw.fetch_strategy_kind,
            strategy_params: raw.strategy_params,
        })
    }

    /// Returns a string strategy parameter, if present.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.strategy_params.get(key).and_then(Value::as_str)
    }
}

fn hosts_of(urls: &[Url]) -> Vec<String> {
    let mut hosts: Vec<String> = urls
        .iter()
        .filter_map(|u| u.host_str().map(str::to_lowercase))
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

/// Loads a single source config file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read, or any error
/// from [`SourceConfig::from_json_str`].
#[instrument(fields(path = %path.display()))]
pub fn load_source_config(path: &Path) -> Result<SourceConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    SourceConfig::from_json_str(&raw, &path.display().to_string())
}

/// Loads every `*.json` config in `dir`, sorted by file name.
///
/// Individual files that fail to load are returned as errors alongside their
/// path so that one malformed vendor does not prevent the others from running.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the directory cannot be read and
/// [`ConfigError::NoConfigs`] if it contains no JSON files.
#[instrument(fields(dir = %dir.display()))]
pub fn load_source_configs(
    dir: &Path,
) -> Result<Vec<(PathBuf, Result<SourceConfig, ConfigError>)>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(ConfigError::NoConfigs {
            dir: dir.to_path_buf(),
        });
    }

    Ok(paths
        .into_iter()
        .map(|path| {
            let loaded = load_source_config(&path);
            if let Err(e) = &loaded {
                warn!(path = %path.display(), error = %e, "skipping unloadable source config");
            }
            (path, loaded)
        })
        .collect())
}

/// Run-wide settings shared by every source.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Concurrent artifact downloads per source (1..=16).
    pub download_concurrency: usize,
    /// Retry policy for artifact downloads.
    pub retry_policy: RetryPolicy,
    /// Minimum delay between requests to the same host; zero disables.
    pub politeness_delay: Duration,
    /// Timeout for one page or API fetch.
    pub fetch_timeout: Duration,
    /// Timeout for one artifact download.
    pub download_timeout: Duration,
    /// Discover and dedup only; skip downloads and writes.
    pub dry_run: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            politeness_delay: Duration::from_millis(DEFAULT_POLITENESS_DELAY_MS),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            dry_run: false,
        }
    }
}

impl PipelineSettings {
    /// Validates ranges that the CLI cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when download concurrency is outside
    /// `1..=16`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DOWNLOAD_CONCURRENCY).contains(&self.download_concurrency) {
            return Err(ConfigError::invalid(
                "settings",
                format!(
                    "download concurrency {} outside 1..={MAX_DOWNLOAD_CONCURRENCY}",
                    self.download_concurrency
                ),
            ));
        }
        Ok(())
    }
}
