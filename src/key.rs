//! Cache key derivation.
//!
//! Keys must match, bit for bit, the keys written by the storefront that
//! populates the shared store. The producer hashes the PHP `json_encode`
//! rendering of `[isHttps, fullUrl, varySignal]` with SHA-1 and stores the
//! uppercase hex digest, so the canonical form here reproduces PHP's default
//! escaping rules rather than serde_json's.

use std::fmt;
use std::io::{self, Write};

use http::header::{COOKIE, HOST};
use http::request::Parts;
use http::HeaderMap;
use serde::Serialize;
use serde_json::ser::Formatter;
use sha1::{Digest, Sha1};

/// Cookie carrying the storefront's context hash.
pub const DEFAULT_VARY_COOKIE: &str = "X-Magento-Vary";

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const CLOUDFRONT_FORWARDED_PROTO: &str = "cloudfront-forwarded-proto";

/// A derived cache key: 40 uppercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parses an already-derived key. Lowercase input is normalised.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

/// The three values that identify a cached page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyComponents {
    pub https: bool,
    pub url: String,
    pub vary: Option<String>,
}

impl KeyComponents {
    /// Renders `[https,url,vary]` exactly as PHP's `json_encode` would.
    pub fn canonical_json(&self) -> String {
        let mut out = Vec::with_capacity(self.url.len() + 32);
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, PhpFormatter);
        let tuple = (self.https, self.url.as_str(), self.vary.as_deref());
        if let Err(err) = tuple.serialize(&mut serializer) {
            tracing::error!(error = %err, "failed to render canonical key tuple");
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// SHA-1 of the canonical form, uppercase hex.
    pub fn digest(&self) -> CacheKey {
        let digest = Sha1::digest(self.canonical_json().as_bytes());
        CacheKey(hex::encode_upper(digest))
    }
}

/// serde_json formatter reproducing PHP's default string escaping.
///
/// serde_json already escapes quotes, backslashes and control characters the
/// same way PHP does (short forms for `\b \f \n \r \t`, lowercase `\u00XX`
/// otherwise). PHP additionally escapes `/` and every non-ASCII code point.
struct PhpFormatter;

impl Formatter for PhpFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        let mut start = 0;
        for (idx, ch) in fragment.char_indices() {
            if ch != '/' && ch.is_ascii() {
                continue;
            }
            if start < idx {
                writer.write_all(fragment[start..idx].as_bytes())?;
            }
            if ch == '/' {
                writer.write_all(b"\\/")?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
            start = idx + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Builds cache keys from request heads.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    assume_https: bool,
    host_override: Option<String>,
    vary_cookie: String,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            assume_https: true,
            host_override: None,
            vary_cookie: DEFAULT_VARY_COOKIE.to_owned(),
        }
    }
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat every request as HTTPS regardless of forwarding headers.
    pub fn with_assume_https(mut self, assume_https: bool) -> Self {
        self.assume_https = assume_https;
        self
    }

    /// Use a fixed host instead of the request's `Host` header.
    pub fn with_host_override(mut self, host: Option<String>) -> Self {
        self.host_override = host.filter(|host| !host.is_empty());
        self
    }

    pub fn with_vary_cookie(mut self, name: impl Into<String>) -> Self {
        self.vary_cookie = name.into();
        self
    }

    pub fn derive(&self, parts: &Parts) -> CacheKey {
        self.components(parts).digest()
    }

    /// Extracts the key tuple. Never fails; anomalies are logged and a
    /// best-effort tuple is returned.
    pub fn components(&self, parts: &Parts) -> KeyComponents {
        let forwarded = forwarded_proto(&parts.headers);
        let https = self.assume_https || forwarded == Some("https");
        let scheme = if self.assume_https {
            "https"
        } else {
            forwarded.unwrap_or("http")
        };

        let host = match &self.host_override {
            Some(host) => host.as_str(),
            None => parts
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
                .unwrap_or_default(),
        };

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_default();

        if host.is_empty() || path.is_empty() {
            tracing::warn!(
                uri = %parts.uri,
                host_missing = host.is_empty(),
                path_missing = path.is_empty(),
                "cache key derived from incomplete request"
            );
        }

        KeyComponents {
            https,
            url: format!("{scheme}://{host}{path}"),
            vary: cookie_value(&parts.headers, &self.vary_cookie),
        }
    }
}

fn forwarded_proto(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(FORWARDED_PROTO)
        .or_else(|| headers.get(CLOUDFRONT_FORWARDED_PROTO))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// First value of cookie `name` across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(cookie, _)| cookie.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_owned())
}
