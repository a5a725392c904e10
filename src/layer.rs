use std::convert::Infallible;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service, ServiceExt};

use crate::backend::SharedCacheStore;
use crate::error::BoxError;
use crate::pipeline::{Pipeline, RequestContext};

/// Terminal service answering every request from cache.
///
/// Hits get the stored page, everything else the not-cached answer. It never
/// fails, so it can be mounted directly as an axum fallback service.
pub struct FpcService<S> {
    pipeline: Pipeline<S>,
}

impl<S: Clone> Clone for FpcService<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<S: SharedCacheStore> FpcService<S> {
    pub fn new(pipeline: Pipeline<S>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline<S> {
        &self.pipeline
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for FpcService<S>
where
    S: SharedCacheStore,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // the body is never read
        let (parts, _) = req.into_parts();
        let pipeline = self.pipeline.clone();
        Box::pin(async move { Ok(pipeline.respond(&parts).await) })
    }
}

/// Puts the cache in front of an inner service.
///
/// Hits are answered from cache; bypasses and misses are forwarded to the
/// inner service untouched. Cloning is cheap and shares every component.
pub struct FpcLayer<S> {
    pipeline: Pipeline<S>,
}

impl<S: Clone> Clone for FpcLayer<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<S: SharedCacheStore> FpcLayer<S> {
    pub fn new(pipeline: Pipeline<S>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline<S> {
        &self.pipeline
    }
}

impl<S, Inner> Layer<Inner> for FpcLayer<S>
where
    S: SharedCacheStore,
{
    type Service = FpcMiddleware<S, Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        FpcMiddleware {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

pub struct FpcMiddleware<S, Inner> {
    inner: Inner,
    pipeline: Pipeline<S>,
}

impl<S: Clone, Inner: Clone> Clone for FpcMiddleware<S, Inner> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<S, Inner, ReqBody, ResBody> Service<Request<ReqBody>> for FpcMiddleware<S, Inner>
where
    S: SharedCacheStore,
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Into<BoxError> + Send,
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // the inner service is driven through `oneshot` on a clone
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let inner = self.inner.clone();
        let (parts, body) = req.into_parts();

        Box::pin(async move {
            let context = RequestContext::new(&parts);
            let lookup = pipeline.lookup_in(&parts, &context).await;
            if lookup.is_hit() {
                return Ok(pipeline.render(lookup, &context).await);
            }

            let diagnostics = pipeline.observe_fallthrough(&lookup, &context);
            let response = inner
                .oneshot(Request::from_parts(parts, body))
                .await
                .map_err(Into::into)?;
            let (mut head, body) = response.into_parts();
            let bytes = BodyExt::collect(body)
                .await
                .map_err(Into::into)?
                .to_bytes();
            diagnostics.apply(&mut head.headers);
            Ok(Response::from_parts(head, Full::from(bytes)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use http::StatusCode;
    use tower::service_fn;

    #[test]
    fn adapters_implement_clone() {
        fn assert_clone<T: Clone>(_: &T) {}

        let pipeline = Pipeline::new(MemoryStore::new());
        let layer = FpcLayer::new(pipeline.clone());
        let middleware = layer.layer(service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(Full::<Bytes>::from("origin")))
        }));

        assert_clone(&FpcService::new(pipeline));
        assert_clone(&middleware);
    }

    #[tokio::test]
    async fn service_answers_not_cached_without_error() {
        let service = FpcService::new(Pipeline::new(MemoryStore::new()));
        let response = service
            .oneshot(Request::get("/").header("host", "shop.example").body(()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
