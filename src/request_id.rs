//! Request correlation ids.
//!
//! Ids come from the `X-Request-ID` header when a proxy in front already
//! assigned one, otherwise a UUID v4 is generated. They tag cache events and
//! are echoed in the debug headers.

use std::fmt;

use http::request::Parts;
use http::HeaderValue;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a new random request ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns `None` for empty or non-UTF-8 values.
    pub fn from_header(header: &HeaderValue) -> Option<Self> {
        header
            .to_str()
            .ok()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Self(value.to_owned()))
    }

    /// Uses the incoming `X-Request-ID` header or generates a new id.
    pub fn from_parts(parts: &Parts) -> Self {
        parts
            .headers
            .get("x-request-id")
            .and_then(Self::from_header)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder();
        if let Some(value) = header {
            builder = builder.header("x-request-id", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn generated_ids_are_unique_uuids() {
        let first = RequestId::new();
        let second = RequestId::new();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(first.as_str()).is_ok());
    }

    #[test]
    fn header_value_is_reused() {
        let id = RequestId::from_parts(&parts(Some("edge-42")));
        assert_eq!(id.as_str(), "edge-42");
        assert_eq!(id.to_string(), "edge-42");
    }

    #[test]
    fn blank_header_generates_new_id() {
        let id = RequestId::from_parts(&parts(Some("  ")));
        assert!(Uuid::parse_str(id.as_str()).is_ok());

        let id = RequestId::from_parts(&parts(None));
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }
}
