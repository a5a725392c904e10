use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::instrument;

use super::{SharedCacheStore, CORE_NAMESPACE, DEFAULT_PREFIX, PAYLOAD_FIELD};
use crate::error::CacheError;
use crate::key::CacheKey;

/// Reads pages from the storefront's Redis cache.
///
/// Each page lives in a hash at `zc:k:<prefix><KEY>` with the payload in
/// field `d`. The connection manager is cloned per call, so concurrent
/// lookups never wait on each other.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    namespace: String,
    field: String,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            namespace: format!("{CORE_NAMESPACE}{DEFAULT_PREFIX}"),
            field: PAYLOAD_FIELD.to_owned(),
        }
    }

    /// Opens a managed connection to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::new(connection))
    }

    /// Sets the deployment prefix placed after the `zc:k:` namespace.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.namespace = format!("{CORE_NAMESPACE}{prefix}");
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    fn make_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.namespace, key)
    }
}

#[async_trait]
impl SharedCacheStore for RedisStore {
    #[instrument(skip_all, fields(key = %key), level = "debug")]
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = conn.hget(self.make_key(key), &self.field).await?;
        Ok(data.map(Bytes::from))
    }
}
