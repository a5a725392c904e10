//! Request -> key -> lookup -> response orchestration.
//!
//! A [`Pipeline`] owns every component of the front door. It never fails:
//! store outages, undecodable payloads and transform errors all degrade to a
//! not-cached answer (or an unminified page) and are reported through logs,
//! cache events and, when enabled, debug headers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::request::Parts;
use http::{Response, StatusCode, Uri};
use http_body_util::Full;
use tracing::{debug, error, warn};

use crate::backend::SharedCacheStore;
use crate::classifier::{BypassReason, Classification, RequestClassifier};
use crate::codec::{PageCodec, PayloadCodec, StoredPage};
use crate::key::{CacheKey, KeyDeriver};
use crate::local::LocalCache;
use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
use crate::origin::OriginClient;
use crate::request_id::RequestId;
use crate::response::{Diagnostics, ResponseWriter};
use crate::revalidate::{
    RefreshRequest, RevalidationJob, RevalidatorConfig, StaleRevalidator, StoreRefresher,
};
use crate::transform::{self, PageTransform};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

/// Where a hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    LocalStale,
    Shared,
}

impl Tier {
    /// Value of the `Fast-Cache` debug header.
    pub fn as_header(&self) -> &'static str {
        match self {
            Tier::Local => "HIT (LOCAL)",
            Tier::LocalStale => "STALE",
            Tier::Shared => "HIT",
        }
    }

    fn event_type(&self) -> CacheEventType {
        match self {
            Tier::Local => CacheEventType::LocalHit,
            Tier::LocalStale => CacheEventType::StaleHit,
            Tier::Shared => CacheEventType::Hit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissCause {
    NotFound,
    StoreUnavailable,
    Decode,
}

/// Outcome of looking a request up.
#[derive(Debug, Clone)]
pub enum Lookup {
    Bypass(BypassReason),
    Hit {
        key: CacheKey,
        page: Arc<StoredPage>,
        tier: Tier,
        store_time: Option<Duration>,
    },
    Miss {
        key: CacheKey,
        cause: MissCause,
        store_time: Option<Duration>,
        error: Option<String>,
    },
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }

    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Lookup::Bypass(_) => None,
            Lookup::Hit { key, .. } | Lookup::Miss { key, .. } => Some(key),
        }
    }
}

/// Per-request data carried from lookup to response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub uri: Uri,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(parts: &Parts) -> Self {
        Self {
            request_id: RequestId::from_parts(parts),
            uri: parts.uri.clone(),
            started: Instant::now(),
        }
    }
}

/// The front door. Cheap to clone; clones share every component.
pub struct Pipeline<S> {
    store: S,
    classifier: Arc<RequestClassifier>,
    keys: Arc<KeyDeriver>,
    codec: Arc<dyn PageCodec>,
    local: Option<LocalCache>,
    revalidator: Option<StaleRevalidator>,
    transform: Option<Arc<dyn PageTransform>>,
    writer: ResponseWriter,
    debug_headers: bool,
    events: Arc<EventLogConfig>,
}

impl<S: Clone> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            classifier: self.classifier.clone(),
            keys: self.keys.clone(),
            codec: self.codec.clone(),
            local: self.local.clone(),
            revalidator: self.revalidator.clone(),
            transform: self.transform.clone(),
            writer: self.writer.clone(),
            debug_headers: self.debug_headers,
            events: self.events.clone(),
        }
    }
}

pub struct PipelineBuilder<S> {
    store: S,
    classifier: RequestClassifier,
    keys: KeyDeriver,
    codec: Arc<dyn PageCodec>,
    local: Option<LocalCache>,
    origin: Option<Arc<dyn OriginClient>>,
    revalidation: RevalidatorConfig,
    transform: Option<Arc<dyn PageTransform>>,
    miss_status: StatusCode,
    debug_headers: bool,
    events: EventLogConfig,
}

impl<S: SharedCacheStore> PipelineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            classifier: RequestClassifier::default(),
            keys: KeyDeriver::default(),
            codec: Arc::new(PayloadCodec),
            local: None,
            origin: None,
            revalidation: RevalidatorConfig::default(),
            transform: None,
            miss_status: StatusCode::NOT_FOUND,
            debug_headers: false,
            events: EventLogConfig::default(),
        }
    }

    pub fn classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn key_deriver(mut self, keys: KeyDeriver) -> Self {
        self.keys = keys;
        self
    }

    pub fn codec<C: PageCodec>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Enables the in-process tier.
    pub fn local_cache(mut self, local: LocalCache) -> Self {
        self.local = Some(local);
        self
    }

    /// Has stale local hits re-rendered through `origin` before the shared
    /// store is re-read.
    ///
    /// Revalidation runs whenever the local cache serves stale entries;
    /// without an origin it only re-reads the shared store.
    pub fn revalidate_with(mut self, origin: Arc<dyn OriginClient>, config: RevalidatorConfig) -> Self {
        self.origin = Some(origin);
        self.revalidation = config;
        self
    }

    /// Queue and concurrency limits for stale revalidation.
    pub fn revalidation(mut self, config: RevalidatorConfig) -> Self {
        self.revalidation = config;
        self
    }

    pub fn transform(mut self, transform: Arc<dyn PageTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn miss_status(mut self, status: StatusCode) -> Self {
        self.miss_status = status;
        self
    }

    pub fn debug_headers(mut self, enabled: bool) -> Self {
        self.debug_headers = enabled;
        self
    }

    pub fn event_log(mut self, config: EventLogConfig) -> Self {
        self.events = config;
        self
    }

    /// Builds the pipeline. Revalidation needs a running Tokio runtime; when
    /// there is none it is disabled with a warning.
    pub fn build(self) -> Pipeline<S> {
        let events = Arc::new(self.events);
        let revalidator = match &self.local {
            Some(local) if local.config().serve_stale => {
                if tokio::runtime::Handle::try_current().is_err() {
                    warn!("no Tokio runtime available, stale revalidation disabled");
                    None
                } else {
                    let refresher = StoreRefresher::new(
                        self.store.clone(),
                        self.codec.clone(),
                        local.clone(),
                        self.origin,
                        self.classifier.refresh_header().clone(),
                    );
                    match StaleRevalidator::start(
                        self.revalidation,
                        Arc::new(refresher),
                        events.clone(),
                    ) {
                        Ok(revalidator) => Some(revalidator),
                        Err(err) => {
                            warn!(error = %err, "invalid revalidator config, stale revalidation disabled");
                            None
                        }
                    }
                }
            }
            _ => {
                if self.origin.is_some() {
                    debug!("stale revalidation needs a local cache serving stale entries");
                }
                None
            }
        };

        Pipeline {
            store: self.store,
            classifier: Arc::new(self.classifier),
            keys: Arc::new(self.keys),
            codec: self.codec,
            local: self.local,
            revalidator,
            transform: self.transform,
            writer: ResponseWriter::new(self.miss_status),
            debug_headers: self.debug_headers,
            events,
        }
    }
}

impl<S: SharedCacheStore> Pipeline<S> {
    pub fn builder(store: S) -> PipelineBuilder<S> {
        PipelineBuilder::new(store)
    }

    /// Shared store only: no local tier, no transform, no revalidation.
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn local_cache(&self) -> Option<&LocalCache> {
        self.local.as_ref()
    }

    pub fn revalidator(&self) -> Option<&StaleRevalidator> {
        self.revalidator.as_ref()
    }

    /// Classifies, derives the key and walks the tiers.
    pub async fn lookup(&self, parts: &Parts) -> Lookup {
        self.lookup_in(parts, &RequestContext::new(parts)).await
    }

    /// [`Pipeline::lookup`] for a request whose context already exists, so
    /// background work it triggers carries the same request id.
    pub async fn lookup_in(&self, parts: &Parts, context: &RequestContext) -> Lookup {
        if let Classification::Bypass(reason) = self.classifier.classify(parts) {
            return Lookup::Bypass(reason);
        }
        let key = self.keys.derive(parts);

        if let Some(local) = &self.local {
            if let Some(entry) = local.get(&key).await {
                let tier = if entry.is_stale() {
                    self.schedule_revalidation(&key, parts, context);
                    Tier::LocalStale
                } else {
                    Tier::Local
                };
                return Lookup::Hit {
                    key,
                    page: entry.page,
                    tier,
                    store_time: None,
                };
            }
        }

        let started = Instant::now();
        let fetched = self.store.get(&key).await;
        let store_time = started.elapsed();

        #[cfg(feature = "metrics")]
        histogram!("tower_fpc.store_latency").record(store_time.as_secs_f64());

        match fetched {
            Ok(Some(raw)) => match self.codec.decode(&raw) {
                Ok(page) => {
                    let page = Arc::new(page);
                    if let Some(local) = &self.local {
                        local.put(key.clone(), page.clone()).await;
                    }
                    Lookup::Hit {
                        key,
                        page,
                        tier: Tier::Shared,
                        store_time: Some(store_time),
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "stored page could not be decoded");
                    Lookup::Miss {
                        key,
                        cause: MissCause::Decode,
                        store_time: Some(store_time),
                        error: Some(err.to_string()),
                    }
                }
            },
            Ok(None) => Lookup::Miss {
                key,
                cause: MissCause::NotFound,
                store_time: Some(store_time),
                error: None,
            },
            Err(err) => {
                error!(key = %key, error = %err, "shared cache store unavailable");
                Lookup::Miss {
                    key,
                    cause: MissCause::StoreUnavailable,
                    store_time: Some(store_time),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Answers `parts` entirely from cache.
    pub async fn respond(&self, parts: &Parts) -> Response<Full<Bytes>> {
        let context = RequestContext::new(parts);
        let lookup = self.lookup_in(parts, &context).await;
        self.render(lookup, &context).await
    }

    /// Turns a lookup into a response: the page on a hit, the not-cached
    /// answer otherwise.
    pub async fn render(&self, lookup: Lookup, context: &RequestContext) -> Response<Full<Bytes>> {
        match lookup {
            Lookup::Hit {
                key,
                page,
                tier,
                store_time,
            } => self.serve_hit(key, page, tier, store_time, context).await,
            other => {
                let diagnostics = self.observe_fallthrough(&other, context);
                self.writer.not_cached(diagnostics)
            }
        }
    }

    /// Records a non-hit lookup and returns the debug headers for whatever
    /// response ends up answering it.
    pub fn observe_fallthrough(&self, lookup: &Lookup, context: &RequestContext) -> Diagnostics {
        let mut diagnostics = Diagnostics::new(self.debug_headers);
        diagnostics.request_id(&context.request_id);

        let event = match lookup {
            Lookup::Hit { tier, .. } => tier.event_type(),
            Lookup::Bypass(reason) => {
                diagnostics.outcome("FALSE");
                #[cfg(feature = "metrics")]
                counter!("tower_fpc.bypass", "reason" => reason.as_str()).increment(1);
                debug!(uri = %context.uri, reason = %reason, "request not cacheable");
                CacheEventType::Bypass
            }
            Lookup::Miss {
                key,
                cause,
                store_time,
                error,
            } => {
                diagnostics.key(key);
                if let Some(store_time) = store_time {
                    diagnostics.store_time(*store_time);
                }
                match cause {
                    MissCause::NotFound => {
                        diagnostics.outcome("MISS");
                        #[cfg(feature = "metrics")]
                        counter!("tower_fpc.miss").increment(1);
                        CacheEventType::Miss
                    }
                    MissCause::StoreUnavailable | MissCause::Decode => {
                        diagnostics.outcome("ERROR");
                        if let Some(error) = error {
                            diagnostics.error(error);
                        }
                        if *cause == MissCause::Decode {
                            #[cfg(feature = "metrics")]
                            counter!("tower_fpc.decode_error").increment(1);
                            CacheEventType::DecodeError
                        } else {
                            #[cfg(feature = "metrics")]
                            counter!("tower_fpc.store_unavailable").increment(1);
                            CacheEventType::StoreUnavailable
                        }
                    }
                }
            }
        };
        diagnostics.total_time(context.started.elapsed());

        let mut record = CacheEvent::new(event, context.request_id.clone())
            .with_uri(&context.uri)
            .with_latency(context.started.elapsed());
        match lookup {
            Lookup::Bypass(reason) => record = record.with_detail(reason.to_string()),
            Lookup::Miss {
                key,
                store_time,
                error,
                ..
            } => {
                record = record.with_key(key).with_store_latency(*store_time);
                if let Some(error) = error {
                    record = record.with_detail(error.clone());
                }
            }
            Lookup::Hit { .. } => {}
        }
        record.log(&self.events);

        diagnostics
    }

    async fn serve_hit(
        &self,
        key: CacheKey,
        page: Arc<StoredPage>,
        tier: Tier,
        store_time: Option<Duration>,
        context: &RequestContext,
    ) -> Response<Full<Bytes>> {
        let mut page = page;
        let mut transform_error = None;

        if let Some(transform) = &self.transform {
            if !page.minified {
                match transform::run_blocking(transform.clone(), page.content.clone()).await {
                    Ok(content) => {
                        let mut upgraded = StoredPage::clone(&page);
                        upgraded.content = content;
                        upgraded.minified = true;
                        let upgraded = Arc::new(upgraded);
                        if let Some(local) = &self.local {
                            if !local.replace_page(&key, &page, upgraded.clone()).await {
                                debug!(key = %key, "local entry changed during transform, upgrade discarded");
                            }
                        }
                        page = upgraded;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "page transform failed, serving original");
                        CacheEvent::new(CacheEventType::TransformError, context.request_id.clone())
                            .with_key(&key)
                            .with_detail(err.to_string())
                            .log(&self.events);
                        transform_error = Some(err.to_string());
                    }
                }
            }
        }

        #[cfg(feature = "metrics")]
        counter!("tower_fpc.hit", "tier" => tier.as_header()).increment(1);

        let mut diagnostics = Diagnostics::new(self.debug_headers);
        diagnostics
            .outcome(tier.as_header())
            .key(&key)
            .request_id(&context.request_id);
        if let Some(store_time) = store_time {
            diagnostics.store_time(store_time);
        }
        if let Some(error) = &transform_error {
            diagnostics.error(error);
        }
        diagnostics.total_time(context.started.elapsed());

        CacheEvent::new(tier.event_type(), context.request_id.clone())
            .with_key(&key)
            .with_uri(&context.uri)
            .with_latency(context.started.elapsed())
            .with_store_latency(store_time)
            .with_size(page.size())
            .log(&self.events);

        self.writer.hit(&page, diagnostics)
    }

    fn schedule_revalidation(&self, key: &CacheKey, parts: &Parts, context: &RequestContext) {
        let Some(revalidator) = &self.revalidator else {
            return;
        };
        let submission = revalidator.submit(RevalidationJob {
            key: key.clone(),
            request: RefreshRequest::from_parts(parts),
            request_id: context.request_id.clone(),
        });
        debug!(key = %key, ?submission, "stale entry revalidation requested");
    }

    /// Stops background revalidation, if running.
    pub async fn shutdown(&self) {
        if let Some(revalidator) = &self.revalidator {
            revalidator.shutdown().await;
        }
    }
}
