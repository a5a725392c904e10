//! Shared cache stores.
//!
//! The front door only ever reads from the shared store; the storefront owns
//! writes and expiry. This module ships with:
//! - [`memory::MemoryStore`], a process-local store for development and tests.
//! - `redis::RedisStore` *(optional)*, reading the storefront's Redis hashes
//!   when the `redis-store` crate feature is enabled.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;
use crate::key::CacheKey;

/// Namespace the storefront's cache backend puts in front of every key.
pub const CORE_NAMESPACE: &str = "zc:k:";
/// Deployment prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "b30_";
/// Hash field holding the payload.
pub const PAYLOAD_FIELD: &str = "d";

/// Full store key for `key` under `prefix`.
pub fn namespaced_key(prefix: &str, key: &CacheKey) -> String {
    format!("{CORE_NAMESPACE}{prefix}{key}")
}

#[async_trait]
pub trait SharedCacheStore: Send + Sync + Clone + 'static {
    /// Fetches the raw payload stored for `key`.
    ///
    /// `Ok(None)` is a plain miss. `Err` means the store could not be
    /// reached and is reported separately from a miss.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError>;
}
