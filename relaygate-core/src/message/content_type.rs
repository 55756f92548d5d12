//! Minimal content-type handling for message bodies.

use std::fmt;

/// A parsed `Content-Type` value.
///
/// Only the media type essence and the parameters are kept; comparison is
/// done on the lowercased essence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    essence: String,
    raw: String,
}

impl ContentType {
    /// Parse a header value. Never fails; garbage yields an octet-stream
    /// essence while preserving the raw text.
    pub fn parse(value: &str) -> Self {
        let raw = value.trim().to_string();
        let essence = raw
            .split(';')
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| s.contains('/'))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Self { essence, raw }
    }

    pub fn xml() -> Self {
        Self::parse("text/xml; charset=utf-8")
    }

    pub fn soap12() -> Self {
        Self::parse("application/soap+xml; charset=utf-8")
    }

    pub fn json() -> Self {
        Self::parse("application/json")
    }

    pub fn text() -> Self {
        Self::parse("text/plain; charset=utf-8")
    }

    pub fn octet_stream() -> Self {
        Self::parse("application/octet-stream")
    }

    /// Media type without parameters, lowercased.
    pub fn essence(&self) -> &str {
        &self.essence
    }

    /// Full header value as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_xml(&self) -> bool {
        matches!(self.essence.as_str(), "text/xml" | "application/xml")
            || self.essence.ends_with("+xml")
    }

    pub fn is_json(&self) -> bool {
        self.essence == "application/json" || self.essence.ends_with("+json")
    }

    /// Textual types whose body can be carried as a text queue message.
    pub fn is_textual(&self) -> bool {
        self.essence.starts_with("text/") || self.is_xml() || self.is_json()
    }

    /// Look up a parameter such as `charset`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.raw.split(';').skip(1).find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().trim_matches('"'))
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::octet_stream()
    }
}
