//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use tower_fpc::prelude::*;
//! let pipeline = Pipeline::builder(MemoryStore::new())
//!     .debug_headers(true)
//!     .build();
//! let service = FpcService::new(pipeline);
//! # drop(service);
//! ```

pub use crate::admin::{AdminConfig, AdminState};
pub use crate::backend::memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use crate::backend::redis::RedisStore;
pub use crate::backend::SharedCacheStore;
pub use crate::classifier::{BypassReason, Classification, RequestClassifier};
pub use crate::codec::{PageCodec, PayloadCodec, StoredPage};
pub use crate::config::FpcConfig;
pub use crate::key::{CacheKey, KeyDeriver};
pub use crate::layer::{FpcLayer, FpcMiddleware, FpcService};
pub use crate::local::{EntryState, LocalCache, LocalCacheConfig};
pub use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
#[cfg(feature = "http-origin")]
pub use crate::origin::HttpOrigin;
pub use crate::origin::{OriginClient, ServiceOrigin};
pub use crate::pipeline::{Lookup, MissCause, Pipeline, PipelineBuilder, Tier};
pub use crate::revalidate::{RevalidatorConfig, StaleRevalidator};
#[cfg(feature = "minify")]
pub use crate::transform::HtmlMinifier;
pub use crate::transform::PageTransform;
