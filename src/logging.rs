//! Structured cache events.
//!
//! Every lookup outcome can be emitted as one JSON document on the
//! `tower_fpc::events` target, for log pipelines that compute hit ratios or
//! look for keys that keep missing. Events are sampled.

use std::time::{Duration, SystemTime};

use http::Uri;
use serde::Serialize;
use serde_json::json;

use crate::key::CacheKey;
use crate::request_id::RequestId;

pub const EVENT_TARGET: &str = "tower_fpc::events";

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Sample rate (1.0 = every request, 0.1 = 10%).
    pub sample_rate: f64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
        }
    }
}

impl EventLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sample rate, clamped to `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn should_sample(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        use std::collections::hash_map::RandomState;
        use std::hash::BuildHasher;

        let random = (RandomState::new().hash_one(SystemTime::now()) as f64) / (u64::MAX as f64);
        random < self.sample_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventType {
    Hit,
    LocalHit,
    StaleHit,
    Miss,
    Bypass,
    StoreUnavailable,
    DecodeError,
    TransformError,
    Revalidated,
    RevalidateFailed,
    AdminAccess,
}

impl CacheEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEventType::Hit => "hit",
            CacheEventType::LocalHit => "local_hit",
            CacheEventType::StaleHit => "stale_hit",
            CacheEventType::Miss => "miss",
            CacheEventType::Bypass => "bypass",
            CacheEventType::StoreUnavailable => "store_unavailable",
            CacheEventType::DecodeError => "decode_error",
            CacheEventType::TransformError => "transform_error",
            CacheEventType::Revalidated => "revalidated",
            CacheEventType::RevalidateFailed => "revalidate_failed",
            CacheEventType::AdminAccess => "admin_access",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub timestamp: SystemTime,
    pub event_type: CacheEventType,
    pub request_id: RequestId,
    pub key: Option<CacheKey>,
    pub uri: Option<Uri>,
    pub latency_us: Option<u64>,
    pub store_latency_us: Option<u64>,
    pub size_bytes: Option<usize>,
    pub detail: Option<String>,
}

impl CacheEvent {
    pub fn new(event_type: CacheEventType, request_id: RequestId) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            request_id,
            key: None,
            uri: None,
            latency_us: None,
            store_latency_us: None,
            size_bytes: None,
            detail: None,
        }
    }

    pub fn with_key(mut self, key: &CacheKey) -> Self {
        self.key = Some(key.clone());
        self
    }

    pub fn with_uri(mut self, uri: &Uri) -> Self {
        self.uri = Some(uri.clone());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(latency.as_micros() as u64);
        self
    }

    pub fn with_store_latency(mut self, latency: Option<Duration>) -> Self {
        self.store_latency_us = latency.map(|latency| latency.as_micros() as u64);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "timestamp": chrono::DateTime::<chrono::Utc>::from(self.timestamp)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            "event": self.event_type.as_str(),
            "request_id": self.request_id.as_str(),
            "key": self.key.as_ref().map(CacheKey::as_str),
            "uri": self.uri.as_ref().map(|uri| uri.to_string()),
            "latency_us": self.latency_us,
            "store_latency_us": self.store_latency_us,
            "size_bytes": self.size_bytes,
            "detail": self.detail,
        })
    }

    /// Emits the event if `config` samples it.
    pub fn log(&self, config: &EventLogConfig) {
        if !config.should_sample() {
            return;
        }
        tracing::info!(target: EVENT_TARGET, event = %self.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_and_clamping() {
        let config = EventLogConfig::new().with_enabled(true).with_sample_rate(0.5);
        assert!(config.enabled);
        assert_eq!(config.sample_rate, 0.5);

        assert_eq!(EventLogConfig::new().with_sample_rate(1.5).sample_rate, 1.0);
        assert_eq!(EventLogConfig::new().with_sample_rate(-0.5).sample_rate, 0.0);
    }

    #[test]
    fn sampling_respects_enabled_flag() {
        assert!(!EventLogConfig::new().should_sample());
        assert!(EventLogConfig::new().with_enabled(true).should_sample());
        assert!(!EventLogConfig::new()
            .with_enabled(true)
            .with_sample_rate(0.0)
            .should_sample());
    }

    #[test]
    fn event_serializes_fields() {
        let key = CacheKey::parse("7412992F89556010939ED31F18279C4B090BA0C3").unwrap();
        let uri: Uri = "/women.html".parse().unwrap();
        let event = CacheEvent::new(CacheEventType::StaleHit, RequestId::from("rid".to_string()))
            .with_key(&key)
            .with_uri(&uri)
            .with_latency(Duration::from_micros(250))
            .with_size(42);

        let value = event.to_json();
        assert_eq!(value["event"], "stale_hit");
        assert_eq!(value["request_id"], "rid");
        assert_eq!(value["key"], key.as_str());
        assert_eq!(value["uri"], "/women.html");
        assert_eq!(value["latency_us"], 250);
        assert_eq!(value["size_bytes"], 42);
        assert!(value["detail"].is_null());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn revalidation_events_serialize() {
        let key = CacheKey::parse("7412992F89556010939ED31F18279C4B090BA0C3").unwrap();
        let refreshed = CacheEvent::new(CacheEventType::Revalidated, RequestId::from("r1".to_string()))
            .with_key(&key)
            .with_latency(Duration::from_millis(3))
            .to_json();
        assert_eq!(refreshed["event"], "revalidated");
        assert_eq!(refreshed["latency_us"], 3_000);

        let failed = CacheEvent::new(CacheEventType::RevalidateFailed, RequestId::from("r2".to_string()))
            .with_key(&key)
            .with_detail("origin answered 500 Internal Server Error")
            .to_json();
        assert_eq!(failed["event"], "revalidate_failed");
        assert_eq!(failed["detail"], "origin answered 500 Internal Server Error");
        assert_eq!(
            serde_json::to_value(CacheEventType::RevalidateFailed).unwrap(),
            "revalidate_failed"
        );
    }
}
