use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::SharedCacheStore;
use crate::error::CacheError;
use crate::key::CacheKey;

/// A process-local [`SharedCacheStore`].
///
/// Stands in for Redis in development and tests. The store is cheap to clone
/// and all clones share the same entries; it can be switched to an
/// unavailable state to exercise the degraded path.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<CacheKey, Bytes>>,
    unavailable: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw payload, as the storefront would.
    pub fn insert(&self, key: CacheKey, payload: impl Into<Bytes>) {
        self.entries.insert(key, payload.into());
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.remove(key).map(|(_, payload)| payload)
    }

    /// Makes every subsequent read fail until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of reads served so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SharedCacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("memory store marked unavailable".into()));
        }
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}
