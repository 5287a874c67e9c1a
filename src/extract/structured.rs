//! Structured (JSON) payload extraction.
//!
//! Vendor APIs wrap their file lists in a handful of envelope shapes. The
//! [`LIST_RULES`] table is probed in order and the first non-empty array
//! wins; adding support for a new vendor shape is adding a row.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::{CandidateArtifact, ExtractContext, Extraction, ExtractionError};
use crate::url_norm::resolve_reference;

/// Where to look for the item array in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListRule {
    /// The payload itself is the array.
    Root,
    /// A fixed key path from the root.
    Path(&'static [&'static str]),
    /// The single key under this path whose value is a non-empty array of
    /// objects, whatever it is called.
    AnyArrayUnder(&'static [&'static str]),
}

/// Envelope probes, in priority order.
pub const LIST_RULES: &[ListRule] = &[
    ListRule::Root,
    ListRule::Path(&["data"]),
    ListRule::Path(&["data", "fileList"]),
    ListRule::Path(&["fileList"]),
    ListRule::Path(&["data", "items"]),
    ListRule::Path(&["items"]),
    ListRule::Path(&["results"]),
    ListRule::Path(&["data", "list"]),
    ListRule::Path(&["list"]),
    ListRule::AnyArrayUnder(&[]),
    ListRule::AnyArrayUnder(&["data"]),
];

const URL_FIELDS: &[&str] = &["fileUrl", "url", "href", "downloadUrl", "file", "pdf"];
const TITLE_FIELDS: &[&str] = &["title", "name", "fileName", "productName"];
const SIZE_FIELDS: &[&str] = &["size", "fileSize"];
const LINK_FIELDS: &[&str] = &["link", "pageUrl", "detailUrl"];

impl ListRule {
    /// Returns the non-empty array this rule selects, if any.
    #[must_use]
    pub fn probe<'a>(&self, payload: &'a Value) -> Option<&'a [Value]> {
        let found = match self {
            Self::Root => payload.as_array(),
            Self::Path(path) => walk(payload, path).and_then(Value::as_array),
            Self::AnyArrayUnder(path) => {
                let object = walk(payload, path)?.as_object()?;
                let mut arrays = object.values().filter_map(Value::as_array).filter(|items| {
                    !items.is_empty() && items.iter().all(Value::is_object)
                });
                let first = arrays.next()?;
                // Ambiguous when two keys hold object arrays.
                if arrays.next().is_some() {
                    return None;
                }
                Some(first)
            }
        }?;
        (!found.is_empty()).then_some(found.as_slice())
    }

    /// True when the rule's fixed path holds an array, even an empty one.
    fn resolves(&self, payload: &Value) -> bool {
        match self {
            Self::Root => payload.is_array(),
            Self::Path(path) => walk(payload, path).is_some_and(Value::is_array),
            Self::AnyArrayUnder(_) => false,
        }
    }
}

fn walk<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

pub(super) fn extract(
    payload: &Value,
    base_url: &Url,
    ctx: &ExtractContext<'_>,
    discovered_at: DateTime<Utc>,
) -> Extraction {
    let mut extraction = Extraction::default();

    let Some((rule, items)) = LIST_RULES
        .iter()
        .find_map(|rule| rule.probe(payload).map(|items| (rule, items)))
    else {
        if LIST_RULES.iter().any(|rule| rule.resolves(payload)) {
            debug!(url = %base_url, "list envelope present but empty");
            return extraction;
        }
        let mut keys: Vec<String> = payload
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        debug!(url = %base_url, "no list envelope matched payload");
        extraction.notes.push(ExtractionError::UnrecognizedShape {
            url: base_url.to_string(),
            keys,
        });
        return extraction;
    };

    trace!(?rule, items = items.len(), "list envelope matched");

    let mut seen_links = HashSet::new();
    for item in items {
        match item {
            Value::String(reference) => {
                if let Some(url) = resolve_reference(base_url, reference)
                    && ctx.pattern.matches(&url)
                {
                    extraction.push_artifact(candidate(ctx, url, None, None, base_url, discovered_at));
                }
            }
            Value::Object(_) => {
                if let Some(url) = first_str(item, URL_FIELDS)
                    .and_then(|r| resolve_reference(base_url, r))
                    .filter(|url| ctx.pattern.matches(url))
                {
                    let title = first_str(item, TITLE_FIELDS)
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string);
                    let size = size_of(item);
                    extraction.push_artifact(candidate(ctx, url, title, size, base_url, discovered_at));
                }
                if let Some(link) =
                    first_str(item, LINK_FIELDS).and_then(|r| resolve_reference(base_url, r))
                {
                    extraction.push_link(link, &mut seen_links);
                }
            }
            _ => {}
        }
    }

    extraction
}

fn candidate(
    ctx: &ExtractContext<'_>,
    artifact_url: Url,
    product_name: Option<String>,
    size_hint: Option<u64>,
    source_url: &Url,
    discovered_at: DateTime<Utc>,
) -> CandidateArtifact {
    CandidateArtifact {
        brand: ctx.brand.to_string(),
        product_name,
        artifact_url,
        source_url: source_url.clone(),
        discovered_at,
        size_hint,
    }
}

fn first_str<'a>(item: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|field| item.get(field).and_then(Value::as_str))
        .find(|value| !value.trim().is_empty())
}

/// Reads a size as a number or a numeric string (`"1048576"`).
fn size_of(item: &Value) -> Option<u64> {
    SIZE_FIELDS.iter().find_map(|field| match item.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
