//! Access to the origin application for background revalidation.
//!
//! The front door never renders pages itself. To refresh a stale entry it
//! re-issues the original request to the origin with the force-refresh
//! header, which makes the storefront render the page and write a fresh
//! record into the shared store.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use http::{Request, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use tower::{Service, ServiceExt};

use crate::error::BoxError;

/// Future returned by [`OriginClient::fetch`].
pub type OriginFuture = Pin<Box<dyn Future<Output = Result<StatusCode, BoxError>> + Send>>;

/// Something that can replay a request against the origin.
///
/// Only the status matters; the body is drained so the origin finishes
/// rendering, then discarded.
pub trait OriginClient: Send + Sync + 'static {
    fn fetch(&self, request: Request<()>) -> OriginFuture;
}

/// Adapts any Tower service to [`OriginClient`].
///
/// `ReqBody` is the service's request body type; replayed requests carry its
/// default (empty) value.
pub struct ServiceOrigin<S, ReqBody> {
    inner: S,
    _body: PhantomData<fn() -> ReqBody>,
}

impl<S: Clone, ReqBody> Clone for ServiceOrigin<S, ReqBody> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _body: PhantomData,
        }
    }
}

impl<S, ReqBody> ServiceOrigin<S, ReqBody> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _body: PhantomData,
        }
    }
}

impl<S, ReqBody, ResBody> OriginClient for ServiceOrigin<S, ReqBody>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Default + Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    fn fetch(&self, request: Request<()>) -> OriginFuture {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (parts, ()) = request.into_parts();
            let response = inner
                .oneshot(Request::from_parts(parts, ReqBody::default()))
                .await
                .map_err(Into::into)?;
            let status = response.status();
            response.into_body().collect().await.map_err(Into::into)?;
            Ok(status)
        })
    }
}

#[cfg(feature = "http-origin")]
pub use self::http_origin::HttpOrigin;

#[cfg(feature = "http-origin")]
mod http_origin {
    use std::sync::Arc;
    use std::time::Duration;

    use http::Request;

    use super::{OriginClient, OriginFuture};

    /// Replays requests against an origin reachable over HTTP.
    #[derive(Clone)]
    pub struct HttpOrigin {
        client: reqwest::Client,
        base: Arc<str>,
    }

    impl HttpOrigin {
        /// `base` is the origin's scheme and authority, e.g.
        /// `http://127.0.0.1:8081`.
        pub fn new(base: &str) -> Result<Self, reqwest::Error> {
            Self::with_timeout(base, Duration::from_secs(30))
        }

        pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            Ok(Self {
                client,
                base: Arc::from(base.trim_end_matches('/')),
            })
        }

        fn url_for(&self, request: &Request<()>) -> String {
            let path = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("{}{}", self.base, path)
        }
    }

    impl OriginClient for HttpOrigin {
        fn fetch(&self, request: Request<()>) -> OriginFuture {
            let client = self.client.clone();
            let url = self.url_for(&request);
            Box::pin(async move {
                let (parts, ()) = request.into_parts();
                let response = client
                    .request(parts.method, url)
                    .headers(parts.headers)
                    .send()
                    .await?;
                let status = response.status();
                response.bytes().await?;
                Ok(status)
            })
        }
    }

}
