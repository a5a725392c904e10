//! Token-protected listing of the in-process cache.
//!
//! One endpoint, framework agnostic: [`AdminState::handle`] takes the request
//! head and returns a complete response, so it can be mounted under axum or
//! any other Tower stack. The token is accepted from the `X-Secret-Key`
//! header or the `key` query parameter and compared in constant time.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Response, StatusCode, Uri};
use http_body_util::Full;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::local::{LocalCache, LocalEntry};
use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
use crate::request_id::RequestId;

pub const SECRET_KEY_HEADER: &str = "x-secret-key";
pub const SECRET_KEY_PARAM: &str = "key";

const UNAUTHORIZED_BODY: &str = r#"{"error":"Unauthorized"}"#;

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Shared secret; without one every request is rejected.
    pub auth_token: Option<String>,
    pub mount_path: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_token: None,
            mount_path: "/cache/list".to_string(),
        }
    }
}

impl AdminConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Constant-time token check. Missing or empty tokens never match.
    pub fn validate_token(&self, provided: Option<&str>) -> bool {
        match (&self.auth_token, provided) {
            (Some(expected), Some(provided)) if !expected.is_empty() => {
                expected.as_bytes().ct_eq(provided.as_bytes()).into()
            }
            _ => false,
        }
    }
}

/// One row of the listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntrySummary {
    pub key: String,
    pub size: usize,
    /// End of the fresh window, RFC 3339.
    pub expires_at: String,
    pub is_stale: bool,
}

impl From<&LocalEntry> for EntrySummary {
    fn from(entry: &LocalEntry) -> Self {
        Self {
            key: entry.key.to_string(),
            size: entry.page.size(),
            expires_at: DateTime::<Utc>::from(entry.expires_at())
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            is_stale: entry.is_stale(),
        }
    }
}

/// Shared state for the admin handler.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<AdminConfig>,
    local: Option<LocalCache>,
    events: Arc<EventLogConfig>,
}

impl AdminState {
    /// `local` is `None` when the in-process tier is disabled; the listing
    /// is then always empty.
    pub fn new(config: AdminConfig, local: Option<LocalCache>) -> Self {
        Self {
            config: Arc::new(config),
            local,
            events: Arc::new(EventLogConfig::default()),
        }
    }

    pub fn with_event_log(mut self, events: EventLogConfig) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> bool {
        let provided = headers
            .get(SECRET_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .or_else(|| query_param(uri, SECRET_KEY_PARAM));
        self.config.validate_token(provided)
    }

    pub fn listing(&self) -> Vec<EntrySummary> {
        self.local
            .as_ref()
            .map(|local| local.entries().iter().map(EntrySummary::from).collect())
            .unwrap_or_default()
    }

    pub fn handle(&self, headers: &HeaderMap, uri: &Uri) -> Response<Full<Bytes>> {
        let request_id = headers
            .get("x-request-id")
            .and_then(RequestId::from_header)
            .unwrap_or_default();
        let event = CacheEvent::new(CacheEventType::AdminAccess, request_id).with_uri(uri);

        if !self.config.enabled || !self.authorize(headers, uri) {
            tracing::warn!(uri = %uri, "admin listing rejected");
            event.with_detail("unauthorized").log(&self.events);
            return json_response(StatusCode::UNAUTHORIZED, Bytes::from_static(UNAUTHORIZED_BODY.as_bytes()));
        }

        let listing = self.listing();
        event
            .with_detail(format!("{} entries", listing.len()))
            .log(&self.events);
        match serde_json::to_vec(&listing) {
            Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize admin listing");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Bytes::from_static(br#"{"error":"Internal Error"}"#),
                )
            }
        }
    }
}

fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
