//! Filesystem-safe names for stored artifacts.

use url::Url;

use crate::extract::CandidateArtifact;

/// Longest stem kept from a product name or URL segment, in characters.
const MAX_STEM_CHARS: usize = 80;

/// Stem used when neither product name nor URL yield anything usable.
const FALLBACK_STEM: &str = "manual";

/// Lowercase, hyphen-separated brand directory name.
///
/// `"Acme Corp."` becomes `acme-corp`; a brand with no alphanumerics maps to
/// `unknown`.
#[must_use]
pub fn brand_slug(brand: &str) -> String {
    let mut slug = String::with_capacity(brand.len());
    let mut pending_sep = false;
    for ch in brand.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Derives the stored file name for a candidate.
///
/// The stem comes from the product name, else the last URL path segment,
/// else `manual`. The extension comes from the URL, else the response
/// content type, else `.bin`.
#[must_use]
pub fn derive_file_name(candidate: &CandidateArtifact, content_type: Option<&str>) -> String {
    let extension = extension_from_url(&candidate.artifact_url)
        .or_else(|| content_type.and_then(extension_from_content_type).map(str::to_string))
        .unwrap_or_else(|| ".bin".to_string());

    let stem = candidate
        .product_name
        .as_deref()
        .map(|name| strip_suffix_ignore_case(name.trim(), &extension))
        .map(sanitize_component)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            last_segment(&candidate.artifact_url)
                .map(|segment| sanitize_component(strip_extension(&segment)))
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_STEM.to_string());

    let stem: String = stem.chars().take(MAX_STEM_CHARS).collect();
    format!("{}{extension}", stem.trim_end_matches(['_', '.']))
}

/// Replaces path separators, reserved and control characters with `_`,
/// collapsing runs.
pub(crate) fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        let keep = ch.is_alphanumeric() || matches!(ch, '-' | '.');
        if keep {
            out.push(ch);
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }
    out.trim_matches(['_', '.']).to_string()
}

fn last_segment(url: &Url) -> Option<String> {
    let raw = url.path_segments()?.rfind(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |d| d.into_owned());
    Some(decoded)
}

pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let segment = last_segment(url)?;
    let dot = segment.rfind('.')?;
    let ext = &segment[dot..];
    let valid = ext.len() > 1 && ext.len() <= 6 && ext[1..].chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

pub(crate) fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let ext = match mime.as_str() {
        "application/pdf" => ".pdf",
        "application/zip" | "application/x-zip-compressed" => ".zip",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "text/html" => ".html",
        "text/plain" => ".txt",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        _ => return None,
    };
    Some(ext)
}

fn strip_extension(segment: &str) -> &str {
    segment.rfind('.').map_or(segment, |dot| &segment[..dot])
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> &'a str {
    let split = value.len().checked_sub(suffix.len());
    match split {
        Some(at) if value.is_char_boundary(at) && value[at..].eq_ignore_ascii_case(suffix) => {
            &value[..at]
        }
        _ => value,
    }
}
