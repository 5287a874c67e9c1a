//! URL normalization, reference resolution, and allow-list checks.
//!
//! Every URL that enters the visited set, the candidate stream, or a
//! fingerprint goes through [`normalize_url`] first so that trivially
//! different spellings of one address collapse to a single key.

use url::Url;

/// Reference schemes that never lead to a fetchable page or artifact.
const IGNORED_SCHEMES: [&str; 5] = ["mailto:", "javascript:", "tel:", "data:", "about:"];

/// Returns the canonical form of `url`.
///
/// - scheme and host are lowercased (done by the `url` parser)
/// - default ports are dropped (done by the `url` parser)
/// - the fragment is removed
/// - a trailing `/` is removed from non-root paths
/// - an empty query (`?`) is removed
#[must_use]
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    if normalized.query() == Some("") {
        normalized.set_query(None);
    }
    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
        if normalized.path().is_empty() {
            normalized.set_path("/");
        }
    }
    normalized
}

/// Parses an absolute http(s) URL and normalizes it.
#[must_use]
pub fn parse_normalized(raw: &str) -> Option<Url> {
    let parsed = Url::parse(raw.trim()).ok()?;
    is_http(&parsed).then(|| normalize_url(&parsed))
}

/// Resolves a page reference (href/src) against `base` and normalizes it.
///
/// Returns `None` for empty references, pure fragments, non-http schemes
/// (`mailto:`, `javascript:`, ...) and references that fail to parse.
#[must_use]
pub fn resolve_reference(base: &Url, reference: &str) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    let lowered = reference.to_ascii_lowercase();
    if IGNORED_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
        return None;
    }
    let joined = base.join(reference).ok()?;
    is_http(&joined).then(|| normalize_url(&joined))
}

/// Returns true when the host of `url` contains one of `allow_list`.
///
/// Entries are lowercase host substrings (`"acme"` allows `www.acme.com`
/// and `files.acme.eu`). An empty allow-list allows nothing.
#[must_use]
pub fn is_allowed(url: &Url, allow_list: &[String]) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    allow_list
        .iter()
        .any(|domain| !domain.is_empty() && host.contains(domain.as_str()))
}

pub(crate) fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}
