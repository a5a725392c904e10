use thiserror::Error;

/// Boxed error used for origin and inner-service failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while talking to the shared cache store.
///
/// Any of these is treated as "store unavailable": the request degrades to a
/// miss and the failure is logged at error level.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis-store")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Errors raised while turning a raw stored payload into a page.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decompress payload: {0}")]
    Decompress(String),

    #[error("malformed page record: {0}")]
    Malformed(String),
}

/// Errors raised by a page transform. The unmodified page is served instead.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform failed: {0}")]
    Failed(String),

    #[error("transform task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            reason: reason.into(),
        }
    }
}
