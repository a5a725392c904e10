//! Cacheability decisions made before any cache I/O.

use std::fmt;

use http::header::HeaderName;
use http::request::Parts;
use http::Method;

/// Header that forces a request through to the origin.
pub const DEFAULT_REFRESH_HEADER: &str = "x-fpc-refresh";

/// Path prefixes that are never served from cache by default.
pub const DEFAULT_IGNORED_PREFIXES: &[&str] =
    &["/customer", "/media", "/admin", "/checkout", "/cf/"];

/// Why a request was not eligible for cached delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    ForceRefresh,
    IgnoredPath(String),
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Method => "method",
            BypassReason::ForceRefresh => "force_refresh",
            BypassReason::IgnoredPath(_) => "ignored_path",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::IgnoredPath(prefix) => write!(f, "ignored_path({prefix})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Cacheable,
    Bypass(BypassReason),
}

/// Decides whether a request may be answered from cache.
///
/// Only `GET` requests without the force-refresh header and outside the
/// ignored path prefixes qualify. Classification is pure and cheap.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    refresh_header: HeaderName,
    ignored_prefixes: Vec<String>,
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self {
            refresh_header: HeaderName::from_static(DEFAULT_REFRESH_HEADER),
            ignored_prefixes: DEFAULT_IGNORED_PREFIXES
                .iter()
                .map(|prefix| (*prefix).to_owned())
                .collect(),
        }
    }
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_header(mut self, header: HeaderName) -> Self {
        self.refresh_header = header;
        self
    }

    /// Replaces the ignored path prefixes. Empty entries are dropped.
    pub fn with_ignored_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_prefixes = prefixes
            .into_iter()
            .map(Into::into)
            .filter(|prefix| !prefix.is_empty())
            .collect();
        self
    }

    pub fn refresh_header(&self) -> &HeaderName {
        &self.refresh_header
    }

    pub fn ignored_prefixes(&self) -> &[String] {
        &self.ignored_prefixes
    }

    pub fn classify(&self, parts: &Parts) -> Classification {
        if parts.method != Method::GET {
            return Classification::Bypass(BypassReason::Method);
        }
        if parts.headers.contains_key(&self.refresh_header) {
            return Classification::Bypass(BypassReason::ForceRefresh);
        }
        let path = parts.uri.path();
        if let Some(prefix) = self
            .ignored_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
        {
            return Classification::Bypass(BypassReason::IgnoredPath(prefix.clone()));
        }
        Classification::Cacheable
    }

    pub fn is_cacheable(&self, parts: &Parts) -> bool {
        self.classify(parts) == Classification::Cacheable
    }
}
