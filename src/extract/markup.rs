//! HTML reference extraction.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::trace;
use url::Url;

use super::{CandidateArtifact, ExtractContext, Extraction};
use crate::url_norm::{is_http, resolve_reference};

/// Elements that can reference another page or a document.
const REFERENCE_SELECTOR: &str = "a[href], link[href], iframe[src], embed[src], object[data]";

/// Optional CSS selectors narrowing which elements are considered.
///
/// Read from `strategyParams.linkSelector` and
/// `strategyParams.artifactSelector`. When set, only elements matching the
/// selector contribute links (respectively artifacts).
#[derive(Debug, Clone, Default)]
pub struct MarkupSelectors {
    link: Option<Selector>,
    artifact: Option<Selector>,
}

impl MarkupSelectors {
    /// Parses the selectors from strategy parameters.
    ///
    /// # Errors
    ///
    /// Returns a reason string when a selector is not a string or does not
    /// parse as CSS.
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, String> {
        Ok(Self {
            link: parse_selector(params, "linkSelector")?,
            artifact: parse_selector(params, "artifactSelector")?,
        })
    }
}

fn parse_selector(params: &Map<String, Value>, key: &str) -> Result<Option<Selector>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(css)) => Selector::parse(css)
            .map(Some)
            .map_err(|e| format!("`{key}` {css:?} is not a valid selector: {e}")),
        Some(_) => Err(format!("`{key}` must be a string")),
    }
}

pub(super) fn extract(
    html: &str,
    base_url: &Url,
    ctx: &ExtractContext<'_>,
    discovered_at: DateTime<Utc>,
) -> Extraction {
    let document = Html::parse_document(html);
    let base = document_base(&document, base_url);

    let mut extraction = Extraction::default();
    let mut seen_links = HashSet::new();

    let Ok(references) = Selector::parse(REFERENCE_SELECTOR) else {
        return extraction;
    };

    for element in document.select(&references) {
        let Some(reference) = reference_of(&element) else {
            continue;
        };
        let Some(url) = resolve_reference(&base, reference) else {
            trace!(reference, "skipping unresolvable reference");
            continue;
        };

        if ctx.pattern.matches(&url) {
            if !in_scope(ctx.selectors.artifact.as_ref(), element) {
                continue;
            }
            extraction.push_artifact(CandidateArtifact {
                brand: ctx.brand.to_string(),
                product_name: title_of(&element),
                artifact_url: url,
                source_url: base_url.clone(),
                discovered_at,
                size_hint: None,
            });
        } else if in_scope(ctx.selectors.link.as_ref(), element) && is_page_reference(&element) {
            extraction.push_link(url, &mut seen_links);
        }
    }

    extraction
}

/// Resolution base: the first `<base href>`, else the fetched URL.
fn document_base(document: &Html, base_url: &Url) -> Url {
    let Ok(selector) = Selector::parse("base[href]") else {
        return base_url.clone();
    };
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| base_url.join(href.trim()).ok())
        .filter(is_http)
        .unwrap_or_else(|| base_url.clone())
}

/// True when no selector is set, or `element` or one of its ancestors matches.
fn in_scope(selector: Option<&Selector>, element: ElementRef<'_>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .any(|el| selector.matches(&el))
}

fn reference_of<'a>(element: &ElementRef<'a>) -> Option<&'a str> {
    let value = element.value();
    match value.name() {
        "a" | "link" => value.attr("href"),
        "iframe" | "embed" => value.attr("src"),
        "object" => value.attr("data"),
        _ => None,
    }
}

/// Only anchors and frames lead to pages worth traversing; `<link>` to a
/// stylesheet or `<embed>` of media does not.
fn is_page_reference(element: &ElementRef<'_>) -> bool {
    let value = element.value();
    match value.name() {
        "a" | "iframe" => true,
        "link" => value
            .attr("rel")
            .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("alternate"))),
        _ => false,
    }
}

fn title_of(element: &ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = collapse_whitespace(&text);
    if !text.is_empty() {
        return Some(text);
    }
    let value = element.value();
    ["title", "aria-label", "download"]
        .iter()
        .filter_map(|attr| value.attr(attr))
        .map(collapse_whitespace)
        .find(|t| !t.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
