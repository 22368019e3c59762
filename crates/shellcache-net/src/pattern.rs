//! URL patterns used to exclude requests from caching.

use serde::{Deserialize, Serialize};
use url::Url;

/// How an exclusion rule compares its text with a request URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// The serialized URL equals the text.
    Exact,
    /// The serialized URL starts with the text.
    Prefix,
    /// The serialized URL ends with the text.
    Suffix,
    /// The text occurs anywhere in the serialized URL.
    Contains,
}

/// One exclusion rule, written in config as
/// `{ "type": "contains", "pattern": "tailwindcss" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    pub pattern: String,
}

impl UrlPattern {
    pub fn new(pattern_type: PatternType, pattern: impl Into<String>) -> Self {
        Self {
            pattern_type,
            pattern: pattern.into(),
        }
    }

    pub fn exact(url: &str) -> Self {
        Self::new(PatternType::Exact, url)
    }

    pub fn prefix(text: &str) -> Self {
        Self::new(PatternType::Prefix, text)
    }

    pub fn suffix(text: &str) -> Self {
        Self::new(PatternType::Suffix, text)
    }

    pub fn contains(text: &str) -> Self {
        Self::new(PatternType::Contains, text)
    }

    /// Compared against the full URL, query and fragment included.
    pub fn matches(&self, url: &Url) -> bool {
        let (url, text) = (url.as_str(), self.pattern.as_str());
        match self.pattern_type {
            PatternType::Exact => url == text,
            PatternType::Prefix => url.starts_with(text),
            PatternType::Suffix => url.ends_with(text),
            PatternType::Contains => url.contains(text),
        }
    }
}

/// First pattern in `patterns` that matches `url`.
pub fn first_match<'a>(patterns: &'a [UrlPattern], url: &Url) -> Option<&'a UrlPattern> {
    patterns.iter().find(|p| p.matches(url))
}
