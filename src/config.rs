//! Deployment configuration loaded from the environment.
//!
//! # Environment Variables
//!
//! - `REDIS_URL`: full connection URL; otherwise built from `REDIS_HOST`
//!   (`127.0.0.1`), `REDIS_PORT` (`6379`) and `REDIS_DB` (`11`)
//! - `PREFIX`: deployment prefix after the `zc:k:` namespace (`b30_`)
//! - `HTTPS`: treat every request as HTTPS (`true`)
//! - `HOST`: fixed host for cache keys (request `Host` header when unset)
//! - `DEBUG`: attach diagnostic headers (`false`)
//! - `USE_CACHE`: enable the in-process tier (`false`)
//! - `CACHE_TTL`: local primary TTL in seconds (`60`)
//! - `USE_STALE`: serve stale local entries while revalidating (`true`)
//! - `STALE_TTL`: stale window in seconds (ten times `CACHE_TTL`)
//! - `CACHE_CAPACITY`: maximum local entries (`10000`)
//! - `IGNORED_URLS`: comma separated path prefixes never served from cache
//! - `REFRESH_HEADER`: force-refresh header (`x-fpc-refresh`)
//! - `VARY_COOKIE`: vary cookie name (`X-Magento-Vary`)
//! - `MINIFY`: minify pages before serving (`false`)
//! - `MISS_STATUS`: status of the not-cached answer (`404`)
//! - `ORIGIN_URL`: origin base URL; when unset, stale entries are
//!   revalidated from the shared store alone
//! - `REVALIDATE_CONCURRENCY` (`8`) and `REVALIDATE_QUEUE` (`256`)
//! - `SECRET_KEY`: admin listing token; the listing is disabled when unset
//! - `LOG_EVENTS` (`false`) and `EVENT_SAMPLE_RATE` (`1.0`): cache events
//! - `PORT`: listen port of the server binary (`8080`)
//! - `LOG_FORMAT`: `text` or `json`
//!
//! Booleans accept `true`/`1`/`false`/`0`. Unparsable values fall back to
//! the default with a warning.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use http::header::HeaderName;
use http::StatusCode;

use crate::admin::AdminConfig;
use crate::backend::DEFAULT_PREFIX;
use crate::classifier::{RequestClassifier, DEFAULT_IGNORED_PREFIXES, DEFAULT_REFRESH_HEADER};
use crate::error::ConfigError;
use crate::key::{KeyDeriver, DEFAULT_VARY_COOKIE};
use crate::local::LocalCacheConfig;
use crate::logging::EventLogConfig;
use crate::revalidate::RevalidatorConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FpcConfig {
    pub redis_url: Option<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    pub prefix: String,

    pub https: bool,
    pub host: Option<String>,
    pub vary_cookie: String,
    pub refresh_header: String,
    pub ignored_urls: Vec<String>,

    pub use_local_cache: bool,
    /// Primary TTL of the in-process tier.
    pub cache_ttl: Duration,
    pub use_stale: bool,
    pub stale_ttl: Option<Duration>,
    pub cache_capacity: u64,

    pub debug: bool,
    pub minify: bool,
    pub miss_status: u16,

    pub origin_url: Option<String>,
    pub revalidate_concurrency: usize,
    pub revalidate_queue: usize,

    pub secret_key: Option<String>,
    pub log_events: bool,
    pub event_sample_rate: f64,

    pub port: u16,
    pub log_format: LogFormat,
}

impl Default for FpcConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
            redis_db: 11,
            prefix: DEFAULT_PREFIX.into(),
            https: true,
            host: None,
            vary_cookie: DEFAULT_VARY_COOKIE.into(),
            refresh_header: DEFAULT_REFRESH_HEADER.into(),
            ignored_urls: DEFAULT_IGNORED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            use_local_cache: false,
            cache_ttl: Duration::from_secs(60),
            use_stale: true,
            stale_ttl: None,
            cache_capacity: 10_000,
            debug: false,
            minify: false,
            miss_status: 404,
            origin_url: None,
            revalidate_concurrency: 8,
            revalidate_queue: 256,
            secret_key: None,
            log_events: false,
            event_sample_rate: 1.0,
            port: 8080,
            log_format: LogFormat::Text,
        }
    }
}

impl FpcConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        Self {
            redis_url: text("REDIS_URL"),
            redis_host: text("REDIS_HOST").unwrap_or(defaults.redis_host),
            redis_port: parsed(&lookup, "REDIS_PORT", defaults.redis_port),
            redis_db: parsed(&lookup, "REDIS_DB", defaults.redis_db),
            prefix: text("PREFIX").unwrap_or(defaults.prefix),
            https: flag(&lookup, "HTTPS", defaults.https),
            host: text("HOST"),
            vary_cookie: text("VARY_COOKIE").unwrap_or(defaults.vary_cookie),
            refresh_header: text("REFRESH_HEADER").unwrap_or(defaults.refresh_header),
            ignored_urls: text("IGNORED_URLS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|prefix| !prefix.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.ignored_urls),
            use_local_cache: flag(&lookup, "USE_CACHE", defaults.use_local_cache),
            cache_ttl: Duration::from_secs(parsed(&lookup, "CACHE_TTL", 60)),
            use_stale: flag(&lookup, "USE_STALE", defaults.use_stale),
            stale_ttl: text("STALE_TTL").and_then(|value| match value.parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(err) => {
                    tracing::warn!(name = "STALE_TTL", value = %value, error = %err, "ignoring unparsable setting");
                    None
                }
            }),
            cache_capacity: parsed(&lookup, "CACHE_CAPACITY", defaults.cache_capacity),
            debug: flag(&lookup, "DEBUG", defaults.debug),
            minify: flag(&lookup, "MINIFY", defaults.minify),
            miss_status: parsed(&lookup, "MISS_STATUS", defaults.miss_status),
            origin_url: text("ORIGIN_URL"),
            revalidate_concurrency: parsed(
                &lookup,
                "REVALIDATE_CONCURRENCY",
                defaults.revalidate_concurrency,
            ),
            revalidate_queue: parsed(&lookup, "REVALIDATE_QUEUE", defaults.revalidate_queue),
            secret_key: text("SECRET_KEY"),
            log_events: flag(&lookup, "LOG_EVENTS", defaults.log_events),
            event_sample_rate: parsed(&lookup, "EVENT_SAMPLE_RATE", defaults.event_sample_rate),
            port: parsed(&lookup, "PORT", defaults.port),
            log_format: parsed(&lookup, "LOG_FORMAT", defaults.log_format),
        }
    }

    /// Connection URL for the shared store.
    pub fn redis_url(&self) -> String {
        match &self.redis_url {
            Some(url) => url.clone(),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::invalid("CACHE_TTL", "must be greater than zero"));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::invalid("CACHE_CAPACITY", "must be greater than zero"));
        }
        self.revalidator_config()
            .validate()
            .map_err(|reason| ConfigError::invalid("REVALIDATE_CONCURRENCY", reason))?;
        self.refresh_header_name()?;
        self.miss_status()?;
        if !(0.0..=1.0).contains(&self.event_sample_rate) {
            return Err(ConfigError::invalid("EVENT_SAMPLE_RATE", "must be within 0.0..=1.0"));
        }
        Ok(())
    }

    pub fn refresh_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.refresh_header.as_bytes())
            .map_err(|err| ConfigError::invalid("REFRESH_HEADER", err.to_string()))
    }

    pub fn miss_status(&self) -> Result<StatusCode, ConfigError> {
        StatusCode::from_u16(self.miss_status)
            .map_err(|err| ConfigError::invalid("MISS_STATUS", err.to_string()))
    }

    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new()
            .with_assume_https(self.https)
            .with_host_override(self.host.clone())
            .with_vary_cookie(self.vary_cookie.clone())
    }

    pub fn classifier(&self) -> Result<RequestClassifier, ConfigError> {
        Ok(RequestClassifier::new()
            .with_refresh_header(self.refresh_header_name()?)
            .with_ignored_prefixes(self.ignored_urls.iter().cloned()))
    }

    /// `None` when the in-process tier is disabled.
    pub fn local_cache_config(&self) -> Option<LocalCacheConfig> {
        if !self.use_local_cache {
            return None;
        }
        let mut config = LocalCacheConfig::default()
            .with_ttl(self.cache_ttl)
            .with_serve_stale(self.use_stale)
            .with_max_capacity(self.cache_capacity);
        if let Some(stale_ttl) = self.stale_ttl {
            config = config.with_stale_ttl(stale_ttl);
        }
        Some(config)
    }

    pub fn revalidator_config(&self) -> RevalidatorConfig {
        RevalidatorConfig {
            max_concurrent: self.revalidate_concurrency,
            queue_capacity: self.revalidate_queue,
        }
    }

    pub fn admin_config(&self) -> AdminConfig {
        match &self.secret_key {
            Some(token) => AdminConfig::new().with_enabled(true).with_auth_token(token.clone()),
            None => AdminConfig::new(),
        }
    }

    pub fn event_log_config(&self) -> EventLogConfig {
        EventLogConfig::new()
            .with_enabled(self.log_events)
            .with_sample_rate(self.event_sample_rate)
    }
}

fn flag<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "true" | "1" => true,
        "false" | "0" => false,
        _ => {
            tracing::warn!(name, value = %value, "ignoring unparsable boolean setting");
            default
        }
    }
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = lookup(name) else {
        return default;
    };
    let value = value.trim();
    if value.is_empty() {
        return default;
    }
    match value.parse() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(name, value = %value, error = %err, "ignoring unparsable setting");
            default
        }
    }
}
