//! Background revalidation of stale local entries.
//!
//! A stale hit is served immediately and a job is queued on a bounded
//! channel. A single consumer task drains the channel and runs each job on
//! its own task, bounded by a semaphore. A key that is already queued or
//! running is not queued again, and a full queue drops the job: the stale
//! copy keeps serving until its secondary window ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use http::header::HeaderName;
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Uri};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::SharedCacheStore;
use crate::codec::PageCodec;
use crate::error::BoxError;
use crate::key::CacheKey;
use crate::local::LocalCache;
use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
use crate::origin::OriginClient;
use crate::request_id::RequestId;

#[cfg(feature = "metrics")]
use metrics::counter;

/// Headers that describe one connection and must not be replayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct RevalidatorConfig {
    /// Jobs running at the same time.
    pub max_concurrent: usize,
    /// Jobs waiting for the consumer before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for RevalidatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            queue_capacity: 256,
        }
    }
}

impl RevalidatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// What is needed to replay a request against the origin.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RefreshRequest {
    /// Captures the request head, minus connection-level headers.
    pub fn from_parts(parts: &Parts) -> Self {
        let mut headers = parts.headers.clone();
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers,
        }
    }

    /// Builds the replayed request carrying the force-refresh header.
    pub fn to_request(&self, refresh_header: &HeaderName) -> Request<()> {
        let mut request = Request::new(());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
            .headers_mut()
            .insert(refresh_header.clone(), HeaderValue::from_static("1"));
        request
    }
}

#[derive(Debug, Clone)]
pub struct RevalidationJob {
    pub key: CacheKey,
    pub request: RefreshRequest,
    /// Id of the request whose stale hit triggered the job.
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateOutcome {
    /// The local entry now holds the fresh shared value.
    Refreshed,
    /// The local entry was gone by the time the fresh value arrived.
    Skipped,
}

/// Result type for revalidation jobs.
pub type RevalidateResult = Result<RevalidateOutcome, BoxError>;

/// Future type for revalidation jobs.
pub type RevalidateFuture = Pin<Box<dyn Future<Output = RevalidateResult> + Send>>;

/// Performs one revalidation job.
pub trait RevalidateCallback: Send + Sync {
    fn revalidate(&self, job: RevalidationJob) -> RevalidateFuture;
}

/// Default job: replay against the origin (when one is configured), re-read
/// the shared store, decode, and swap the local entry.
///
/// Without an origin the job only picks up whatever the storefront has
/// written to the shared store since the entry was cached.
pub struct StoreRefresher<S> {
    store: S,
    codec: Arc<dyn PageCodec>,
    local: LocalCache,
    origin: Option<Arc<dyn OriginClient>>,
    refresh_header: HeaderName,
}

impl<S: Clone> Clone for StoreRefresher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            codec: self.codec.clone(),
            local: self.local.clone(),
            origin: self.origin.clone(),
            refresh_header: self.refresh_header.clone(),
        }
    }
}

impl<S: SharedCacheStore> StoreRefresher<S> {
    pub fn new(
        store: S,
        codec: Arc<dyn PageCodec>,
        local: LocalCache,
        origin: Option<Arc<dyn OriginClient>>,
        refresh_header: HeaderName,
    ) -> Self {
        Self {
            store,
            codec,
            local,
            origin,
            refresh_header,
        }
    }

    #[instrument(skip_all, fields(key = %job.key), name = "revalidate")]
    async fn run(self, job: RevalidationJob) -> RevalidateResult {
        if let Some(origin) = &self.origin {
            let request = job.request.to_request(&self.refresh_header);
            let status = origin.fetch(request).await?;
            if !status.is_success() {
                return Err(format!("origin answered {status}").into());
            }
        }

        let raw = self
            .store
            .get(&job.key)
            .await?
            .ok_or("shared store has no entry for the key")?;
        let page = self.codec.decode(&raw)?;

        if self.local.get(&job.key).await.is_none() {
            return Ok(RevalidateOutcome::Skipped);
        }
        self.local.put(job.key, Arc::new(page)).await;
        Ok(RevalidateOutcome::Refreshed)
    }
}

impl<S: SharedCacheStore> RevalidateCallback for StoreRefresher<S> {
    fn revalidate(&self, job: RevalidationJob) -> RevalidateFuture {
        Box::pin(self.clone().run(job))
    }
}

/// Result of offering a job to the revalidator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    AlreadyPending,
    QueueFull,
    Closed,
}

/// Marks a key as pending until dropped.
struct PendingGuard {
    key: CacheKey,
    pending: Arc<DashMap<CacheKey, ()>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// Handle to the background revalidation task. Cheap to clone.
#[derive(Clone)]
pub struct StaleRevalidator {
    tx: mpsc::Sender<(RevalidationJob, PendingGuard)>,
    pending: Arc<DashMap<CacheKey, ()>>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    task_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StaleRevalidator {
    /// Spawns the consumer task on the current Tokio runtime. Job outcomes
    /// are reported as cache events through `events`.
    pub fn start(
        config: RevalidatorConfig,
        callback: Arc<dyn RevalidateCallback>,
        events: Arc<EventLogConfig>,
    ) -> Result<Self, String> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        let handle = tokio::spawn(consume(rx, callback, semaphore, events, shutdown_rx));

        info!(
            max_concurrent = config.max_concurrent,
            queue_capacity = config.queue_capacity,
            "stale revalidator started"
        );

        Ok(Self {
            tx,
            pending: Arc::new(DashMap::new()),
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            task_handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Offers a job without waiting. Never blocks the caller.
    pub fn submit(&self, job: RevalidationJob) -> Submission {
        match self.pending.entry(job.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Submission::AlreadyPending,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let guard = PendingGuard {
            key: job.key.clone(),
            pending: self.pending.clone(),
        };

        match self.tx.try_send((job, guard)) {
            Ok(()) => Submission::Queued,
            Err(mpsc::error::TrySendError::Full((job, _guard))) => {
                warn!(key = %job.key, "revalidation queue full, job dropped");
                #[cfg(feature = "metrics")]
                counter!("tower_fpc.revalidate.dropped").increment(1);
                Submission::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Submission::Closed,
        }
    }

    /// Number of keys queued or running.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Stops the consumer and waits for it. Running jobs are left to finish.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("stale revalidator stopped");
    }
}

impl Drop for StaleRevalidator {
    fn drop(&mut self) {
        // Only the last handle signals; clones share the sender slot.
        if Arc::strong_count(&self.shutdown_tx) == 1 {
            if let Ok(mut slot) = self.shutdown_tx.try_lock() {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(());
                }
            }
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<(RevalidationJob, PendingGuard)>,
    callback: Arc<dyn RevalidateCallback>,
    semaphore: Arc<Semaphore>,
    events: Arc<EventLogConfig>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some((job, guard)) = received else { break };
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                };
                let callback = callback.clone();
                let events = events.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let key = job.key.clone();
                    let request_id = job.request_id.clone();
                    let started = Instant::now();

                    #[cfg(feature = "metrics")]
                    counter!("tower_fpc.revalidate.triggered").increment(1);

                    let event = match callback.revalidate(job).await {
                        Ok(RevalidateOutcome::Refreshed) => {
                            debug!(key = %key, "stale entry revalidated");
                            #[cfg(feature = "metrics")]
                            counter!("tower_fpc.revalidate.success").increment(1);
                            CacheEvent::new(CacheEventType::Revalidated, request_id)
                        }
                        Ok(RevalidateOutcome::Skipped) => {
                            debug!(key = %key, "entry gone before revalidation finished");
                            return;
                        }
                        Err(err) => {
                            warn!(key = %key, error = %err, "revalidation failed");
                            #[cfg(feature = "metrics")]
                            counter!("tower_fpc.revalidate.error").increment(1);
                            CacheEvent::new(CacheEventType::RevalidateFailed, request_id)
                                .with_detail(err.to_string())
                        }
                    };
                    event
                        .with_key(&key)
                        .with_latency(started.elapsed())
                        .log(&events);
                });
            }
            _ = &mut shutdown_rx => break,
        }
    }
    debug!("revalidation consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(path: &str) -> RevalidationJob {
        let parts = Request::builder()
            .uri(path)
            .header("host", "shop.example")
            .header("connection", "keep-alive")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        RevalidationJob {
            key: crate::key::KeyDeriver::new().derive(&parts),
            request: RefreshRequest::from_parts(&parts),
            request_id: RequestId::new(),
        }
    }

    struct Blocking {
        runs: AtomicUsize,
        gate: Semaphore,
    }

    impl Blocking {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1_000);
        }
    }

    impl RevalidateCallback for Arc<Blocking> {
        fn revalidate(&self, _job: RevalidationJob) -> RevalidateFuture {
            let this = self.clone();
            Box::pin(async move {
                this.runs.fetch_add(1, Ordering::SeqCst);
                let _ = this.gate.acquire().await;
                Ok(RevalidateOutcome::Refreshed)
            })
        }
    }

    #[test]
    fn refresh_request_drops_hop_by_hop_and_adds_refresh_header() {
        let request = job("/a?b=c")
            .request
            .to_request(&HeaderName::from_static("x-fpc-refresh"));
        assert_eq!(request.uri(), "/a?b=c");
        assert_eq!(request.headers()["host"], "shop.example");
        assert_eq!(request.headers()["x-fpc-refresh"], "1");
        assert!(!request.headers().contains_key("connection"));
    }

    #[test]
    fn config_validation() {
        assert!(RevalidatorConfig::default().validate().is_ok());
        let zero = RevalidatorConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn duplicate_keys_are_not_queued_twice() {
        let callback = Blocking::new();
        let revalidator = StaleRevalidator::start(
            RevalidatorConfig::default(),
            Arc::new(callback.clone()),
            Arc::new(EventLogConfig::default()),
        )
        .unwrap();

        assert_eq!(revalidator.submit(job("/")), Submission::Queued);
        assert_eq!(revalidator.submit(job("/")), Submission::AlreadyPending);
        assert_eq!(revalidator.submit(job("/other")), Submission::Queued);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(callback.runs.load(Ordering::SeqCst), 2);
        assert_eq!(revalidator.pending(), 2);

        callback.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(revalidator.pending(), 0);
        assert_eq!(revalidator.submit(job("/")), Submission::Queued);

        revalidator.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_jobs() {
        let callback = Blocking::new();
        let config = RevalidatorConfig {
            max_concurrent: 1,
            queue_capacity: 1,
        };
        let revalidator = StaleRevalidator::start(
            config,
            Arc::new(callback.clone()),
            Arc::new(EventLogConfig::default()),
        )
        .unwrap();

        // first job runs and holds the only permit, second waits in the
        // consumer for a permit, third sits in the channel
        assert_eq!(revalidator.submit(job("/1")), Submission::Queued);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(revalidator.submit(job("/2")), Submission::Queued);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(revalidator.submit(job("/3")), Submission::Queued);
        assert_eq!(revalidator.submit(job("/4")), Submission::QueueFull);
        assert_eq!(revalidator.pending(), 3);

        callback.release();
        revalidator.shutdown().await;
    }
}
