//! Tower FPC
//! =========
//!
//! `tower-fpc` is a read-only full-page-cache front door for Tower-based
//! services. It answers requests straight from the page records a storefront
//! writes into Redis, with an optional in-process tier that serves stale
//! pages while they are revalidated in the background.
//!
//! Everything hangs off a [`Pipeline`]. Mount it as a terminal
//! [`FpcService`] (misses get a structured not-cached answer), or put it in
//! front of the application with [`FpcLayer`] (misses fall through):
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use tower_fpc::prelude::*;
//!
//! # async fn run() -> Result<(), tower_fpc::error::BoxError> {
//! let app = tower::service_fn(|_req: http::Request<http_body_util::Full<bytes::Bytes>>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("rendered")))
//! });
//!
//! let pipeline = Pipeline::builder(RedisStore::connect("redis://127.0.0.1/11").await?)
//!     .local_cache(LocalCache::new(
//!         LocalCacheConfig::default().with_ttl(Duration::from_secs(60)),
//!     ))
//!     .revalidate_with(
//!         Arc::new(ServiceOrigin::<_, http_body_util::Full<bytes::Bytes>>::new(app.clone())),
//!         RevalidatorConfig::default(),
//!     )
//!     .build();
//!
//! let mut svc = ServiceBuilder::new()
//!     .layer(FpcLayer::new(pipeline))
//!     .service(app);
//!
//! let response = svc
//!     .ready()
//!     .await?
//!     .call(http::Request::new(http_body_util::Full::default()))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod layer;
pub mod local;
pub mod logging;
pub mod origin;
pub mod pipeline;
pub mod prelude;
pub mod request_id;
pub mod response;
pub mod revalidate;
pub mod transform;

pub use admin::{AdminConfig, AdminState};
pub use config::FpcConfig;
pub use layer::{FpcLayer, FpcMiddleware, FpcService};
pub use logging::{CacheEvent, CacheEventType, EventLogConfig};
pub use pipeline::{Lookup, Pipeline, PipelineBuilder};
pub use request_id::RequestId;
