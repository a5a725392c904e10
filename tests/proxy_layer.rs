use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tower::service_fn;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_fpc::key::KeyDeriver;
use tower_fpc::prelude::*;
use tower_fpc::response::FAST_CACHE_HEADER;

fn request(method: Method, path: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "shop.example")
        .body(Full::from(body))
        .unwrap()
}

/// Origin that echoes the request body, counting calls.
fn origin(
    counter: Arc<AtomicUsize>,
) -> BoxCloneService<Request<Full<Bytes>>, Response<Full<Bytes>>, Infallible> {
    BoxCloneService::new(service_fn(move |req: Request<Full<Bytes>>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let echoed = format!("origin:{}", String::from_utf8_lossy(&body));
            let mut response = Response::new(Full::from(echoed));
            *response.status_mut() = StatusCode::CREATED;
            Ok::<_, Infallible>(response)
        }
    }))
}

async fn text(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn miss_falls_through_to_inner_service() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(MemoryStore::new()).debug_headers(true).build();
    let mut svc = ServiceBuilder::new()
        .layer(FpcLayer::new(pipeline))
        .service(origin(calls.clone()));

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(Method::GET, "/new-arrivals.html", ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[FAST_CACHE_HEADER], "MISS");
    assert_eq!(text(response).await, "origin:");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hit_is_served_without_calling_inner() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = MemoryStore::new();
    let key = KeyDeriver::new().derive(&request(Method::GET, "/", "").into_parts().0);
    store.insert(key, PayloadCodec::encode_plain(&StoredPage::new("cached home")).unwrap());

    let layer = FpcLayer::new(Pipeline::new(store));
    let mut svc = ServiceBuilder::new().layer(layer).service(origin(calls.clone()));

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(Method::GET, "/", ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "cached home");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bypass_forwards_request_body_untouched() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = MemoryStore::new();
    let mut svc = ServiceBuilder::new()
        .layer(FpcLayer::new(Pipeline::new(store.clone())))
        .service(origin(calls.clone()));

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(Method::POST, "/customer/account/loginPost", "form=1"))
        .await
        .unwrap();

    assert_eq!(text(response).await, "origin:form=1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.reads(), 0);
}

#[tokio::test]
async fn store_outage_still_reaches_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = MemoryStore::new();
    store.set_available(false);
    let mut svc = ServiceBuilder::new()
        .layer(FpcLayer::new(Pipeline::new(store)))
        .service(origin(calls.clone()));

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(Method::GET, "/", ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
