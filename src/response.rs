//! Building hit and not-cached responses.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::Full;

use crate::codec::StoredPage;
use crate::key::CacheKey;
use crate::request_id::RequestId;

/// Body of every not-cached response.
pub const NOT_CACHED_BODY: &str = r#"{"error":"Not Cached"}"#;
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

pub const FAST_CACHE_HEADER: &str = "fast-cache";
pub const FPC_KEY_HEADER: &str = "fpc-key";
pub const FPC_TIME_HEADER: &str = "fpc-time";
pub const STORE_TIME_HEADER: &str = "redis-time";
pub const FPC_ERROR_HEADER: &str = "fpc-error";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Debug headers attached to a response when diagnostics are enabled.
///
/// A disabled collector ignores every call, so callers can record
/// unconditionally.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    enabled: bool,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            headers: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `Fast-Cache`: HIT, HIT (LOCAL), STALE, MISS, FALSE or ERROR.
    pub fn outcome(&mut self, outcome: &'static str) -> &mut Self {
        self.push(FAST_CACHE_HEADER, HeaderValue::from_static(outcome))
    }

    pub fn key(&mut self, key: &CacheKey) -> &mut Self {
        if let Ok(value) = HeaderValue::from_str(key.as_str()) {
            self.push(FPC_KEY_HEADER, value);
        }
        self
    }

    pub fn total_time(&mut self, elapsed: Duration) -> &mut Self {
        self.push(FPC_TIME_HEADER, millis(elapsed))
    }

    pub fn store_time(&mut self, elapsed: Duration) -> &mut Self {
        self.push(STORE_TIME_HEADER, millis(elapsed))
    }

    pub fn error(&mut self, message: &str) -> &mut Self {
        // error text may contain bytes a header cannot carry
        let sanitized: String = message
            .chars()
            .map(|ch| if ch.is_ascii_graphic() || ch == ' ' { ch } else { '?' })
            .collect();
        if let Ok(value) = HeaderValue::from_str(&sanitized) {
            self.push(FPC_ERROR_HEADER, value);
        }
        self
    }

    pub fn request_id(&mut self, request_id: &RequestId) -> &mut Self {
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            self.push(REQUEST_ID_HEADER, value);
        }
        self
    }

    fn push(&mut self, name: &'static str, value: HeaderValue) -> &mut Self {
        if self.enabled {
            self.headers.push((HeaderName::from_static(name), value));
        }
        self
    }

    /// Writes the collected headers, replacing any earlier values.
    pub fn apply(self, headers: &mut HeaderMap) {
        for (name, value) in self.headers {
            headers.insert(name, value);
        }
    }
}

fn millis(elapsed: Duration) -> HeaderValue {
    let text = format!("{:.2}ms", elapsed.as_secs_f64() * 1_000.0);
    HeaderValue::from_str(&text).unwrap_or_else(|_| HeaderValue::from_static("0ms"))
}

/// Turns lookup results into HTTP responses.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    miss_status: StatusCode,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self {
            miss_status: StatusCode::NOT_FOUND,
        }
    }
}

impl ResponseWriter {
    pub fn new(miss_status: StatusCode) -> Self {
        Self { miss_status }
    }

    pub fn miss_status(&self) -> StatusCode {
        self.miss_status
    }

    /// 200 with the stored headers and content.
    ///
    /// Header names are normalised to lowercase; values are passed through
    /// byte for byte. Framing headers are dropped because the body is the
    /// decoded content, and invalid headers are skipped.
    pub fn hit(&self, page: &StoredPage, diagnostics: Diagnostics) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::from(page.content.clone()));
        let headers = response.headers_mut();
        for (name, value) in &page.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                tracing::debug!(header = %name, "skipping stored header that is not valid HTTP");
                continue;
            };
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONTENT_ENCODING {
                continue;
            }
            headers.insert(name, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
        diagnostics.apply(headers);
        response
    }

    /// The structured not-cached answer used for misses, bypasses and
    /// failures alike.
    pub fn not_cached(&self, diagnostics: Diagnostics) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::from(NOT_CACHED_BODY));
        *response.status_mut() = self.miss_status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        diagnostics.apply(response.headers_mut());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn hit_serves_stored_headers_and_content() {
        let page = StoredPage::new("<p>cached</p>")
            .with_header("X-Magento-Tags", "cms_p_2")
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Length", "999")
            .with_header("Bad Header", "x");

        let response = ResponseWriter::default().hit(&page, Diagnostics::disabled());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-magento-tags"], "cms_p_2");
        assert_eq!(response.headers()[CONTENT_TYPE], HTML_CONTENT_TYPE);
        assert!(!response.headers().contains_key(CONTENT_LENGTH));
        assert!(!response.headers().contains_key(FAST_CACHE_HEADER));
        assert_eq!(body_string(response).await, "<p>cached</p>");
    }

    #[tokio::test]
    async fn not_cached_uses_configured_status() {
        let response = ResponseWriter::default().not_cached(Diagnostics::disabled());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_string(response).await, NOT_CACHED_BODY);

        let response =
            ResponseWriter::new(StatusCode::SERVICE_UNAVAILABLE).not_cached(Diagnostics::disabled());
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn diagnostics_only_when_enabled() {
        let key = CacheKey::parse("7412992F89556010939ED31F18279C4B090BA0C3").unwrap();

        let mut disabled = Diagnostics::disabled();
        disabled.outcome("HIT").key(&key);
        let mut headers = HeaderMap::new();
        disabled.apply(&mut headers);
        assert!(headers.is_empty());

        let mut enabled = Diagnostics::new(true);
        enabled
            .outcome("MISS")
            .key(&key)
            .store_time(Duration::from_micros(1_500))
            .error("boom\nline");
        enabled.apply(&mut headers);
        assert_eq!(headers[FAST_CACHE_HEADER], "MISS");
        assert_eq!(headers[FPC_KEY_HEADER], key.as_str());
        assert_eq!(headers[STORE_TIME_HEADER], "1.50ms");
        assert_eq!(headers[FPC_ERROR_HEADER], "boom?line");
    }
}
