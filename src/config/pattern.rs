//! Artifact URL matchers.

use std::fmt;

use regex::Regex;
use url::Url;

/// Default artifact pattern when a source does not configure one.
pub const DEFAULT_ARTIFACT_PATTERN: &str = ".pdf";

/// Characters that mark a configured pattern as a regular expression.
const REGEX_META: &[char] = &['^', '$', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\'];

/// Decides whether a resolved URL points at a downloadable artifact.
///
/// Patterns are written in configuration as either a plain suffix
/// (`.pdf`) or a regular expression (`re:/manuals/.*\.pdf$`, or any value
/// containing regex metacharacters such as `\.pdf$`).
///
/// Suffix patterns are compared case-insensitively against the URL path only,
/// so `MANUAL.PDF?download=1` still matches `.pdf`. Regex patterns are matched
/// against the full serialized URL.
#[derive(Debug, Clone)]
pub enum ArtifactPattern {
    /// Case-insensitive path suffix.
    Suffix(String),
    /// Regular expression over the full URL.
    Regex(Regex),
}

impl ArtifactPattern {
    /// Parses a configured pattern string.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error when the value is treated as a regex
    /// and does not compile.
    pub fn parse(raw: &str) -> Result<Self, regex::Error> {
        let trimmed = raw.trim();
        if let Some(expr) = trimmed.strip_prefix("re:") {
            return Regex::new(expr).map(Self::Regex);
        }
        if trimmed.contains(REGEX_META) {
            return Regex::new(trimmed).map(Self::Regex);
        }
        let suffix = if trimmed.is_empty() {
            DEFAULT_ARTIFACT_PATTERN
        } else {
            trimmed
        };
        Ok(Self::Suffix(suffix.to_lowercase()))
    }

    /// Returns true when `url` is an artifact under this pattern.
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            Self::Suffix(suffix) => url.path().to_lowercase().ends_with(suffix.as_str()),
            Self::Regex(regex) => regex.is_match(url.as_str()),
        }
    }
}

impl Default for ArtifactPattern {
    fn default() -> Self {
        Self::Suffix(DEFAULT_ARTIFACT_PATTERN.to_string())
    }
}

impl fmt::Display for ArtifactPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suffix(suffix) => write!(f, "{suffix}"),
            Self::Regex(regex) => write!(f, "re:{}", regex.as_str()),
        }
    }
}
