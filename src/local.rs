//! Bounded in-process page cache.
//!
//! Entries go through an explicit lifecycle: `Fresh` until the primary TTL
//! passes, then `Stale` for the secondary window (when stale serving is
//! enabled), then gone. Capacity eviction runs independently of expiry, so
//! unique-key traffic cannot grow the cache past its bound.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::{Entry, Expiry};
use serde::Serialize;

use crate::codec::StoredPage;
use crate::key::CacheKey;

#[cfg(feature = "metrics")]
use metrics::counter;

/// Lifecycle state of a local entry at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Fresh,
    Stale,
}

#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Primary TTL; entries are `Fresh` for this long.
    pub ttl: Duration,
    /// Secondary window; defaults to ten times the primary TTL.
    pub stale_ttl: Option<Duration>,
    /// Serve entries past their primary TTL while they are revalidated.
    pub serve_stale: bool,
    /// Maximum number of entries held.
    pub max_capacity: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            stale_ttl: None,
            serve_stale: true,
            max_capacity: 10_000,
        }
    }
}

impl LocalCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale_ttl(mut self, stale_ttl: Duration) -> Self {
        self.stale_ttl = Some(stale_ttl);
        self
    }

    pub fn with_serve_stale(mut self, serve_stale: bool) -> Self {
        self.serve_stale = serve_stale;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Effective secondary window; zero when stale serving is disabled.
    pub fn stale_window(&self) -> Duration {
        if !self.serve_stale {
            return Duration::ZERO;
        }
        self.stale_ttl.unwrap_or_else(|| self.ttl.saturating_mul(10))
    }
}

/// A local entry as observed by a read.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub key: CacheKey,
    pub page: Arc<StoredPage>,
    pub inserted_at: SystemTime,
    pub ttl: Duration,
    pub state: EntryState,
}

impl LocalEntry {
    pub fn is_stale(&self) -> bool {
        self.state == EntryState::Stale
    }

    /// When the entry stops being fresh.
    pub fn expires_at(&self) -> SystemTime {
        self.inserted_at + self.ttl
    }
}

#[derive(Clone)]
struct Slot {
    page: Arc<StoredPage>,
    inserted_at: SystemTime,
    ttl: Duration,
    fresh_until: Instant,
    retain_until: Instant,
}

impl Slot {
    fn state_at(&self, now: Instant) -> Option<EntryState> {
        if now < self.fresh_until {
            Some(EntryState::Fresh)
        } else if now < self.retain_until {
            Some(EntryState::Stale)
        } else {
            None
        }
    }
}

/// Expires each slot at the end of its own retention window.
struct SlotExpiry;

impl Expiry<CacheKey, Slot> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Slot,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.retain_until.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.retain_until.saturating_duration_since(updated_at))
    }
}

/// The in-process tier. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<CacheKey, Slot>,
    config: Arc<LocalCacheConfig>,
}

impl LocalCache {
    pub fn new(config: LocalCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(SlotExpiry)
            .eviction_listener(|key: Arc<CacheKey>, _slot: Slot, cause: RemovalCause| {
                if cause == RemovalCause::Size {
                    tracing::debug!(key = %key, "local cache evicted entry for capacity");
                    #[cfg(feature = "metrics")]
                    counter!("tower_fpc.local.evicted").increment(1);
                }
            })
            .build();

        Self {
            cache,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LocalCacheConfig {
        &self.config
    }

    /// Returns the entry with its state, or `None` once it is gone.
    pub async fn get(&self, key: &CacheKey) -> Option<LocalEntry> {
        let slot = self.cache.get(key).await?;
        let state = slot.state_at(Instant::now())?;
        Some(LocalEntry {
            key: key.clone(),
            page: slot.page,
            inserted_at: slot.inserted_at,
            ttl: slot.ttl,
            state,
        })
    }

    /// Inserts `page` as a fresh entry, replacing whatever was there.
    pub async fn put(&self, key: CacheKey, page: Arc<StoredPage>) {
        let now = Instant::now();
        let fresh_until = now + self.config.ttl;
        let slot = Slot {
            page,
            inserted_at: SystemTime::now(),
            ttl: self.config.ttl,
            fresh_until,
            retain_until: fresh_until + self.config.stale_window(),
        };
        self.cache.insert(key, slot).await;
    }

    /// Swaps the page of a live entry without touching its timing, but only
    /// while the entry still holds `current`.
    ///
    /// Returns `false` when the entry is gone or was replaced in the meantime,
    /// for example by a revalidation that finished first.
    pub async fn replace_page(
        &self,
        key: &CacheKey,
        current: &Arc<StoredPage>,
        page: Arc<StoredPage>,
    ) -> bool {
        let now = Instant::now();
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let op = match entry.map(Entry::into_value) {
                    Some(slot)
                        if Arc::ptr_eq(&slot.page, current) && slot.state_at(now).is_some() =>
                    {
                        Op::Put(Slot { page, ..slot })
                    }
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::ReplacedWith(_))
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Snapshot of live entries, ordered by key.
    pub fn entries(&self) -> Vec<LocalEntry> {
        let now = Instant::now();
        let mut entries: Vec<LocalEntry> = self
            .cache
            .iter()
            .filter_map(|(key, slot)| {
                let state = slot.state_at(now)?;
                Some(LocalEntry {
                    key: CacheKey::clone(&key),
                    page: slot.page,
                    inserted_at: slot.inserted_at,
                    ttl: slot.ttl,
                    state,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Approximate entry count; exact after [`LocalCache::run_pending_tasks`].
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flushes moka's pending maintenance (evictions, expirations).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
