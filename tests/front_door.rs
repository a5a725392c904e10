use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tower::ServiceExt;
use tower_fpc::key::KeyDeriver;
use tower_fpc::prelude::*;
use tower_fpc::response::{FAST_CACHE_HEADER, FPC_ERROR_HEADER, FPC_KEY_HEADER, NOT_CACHED_BODY};

fn get(path: &str) -> Request<()> {
    Request::get(path)
        .header("host", "shop.example")
        .body(())
        .unwrap()
}

/// Stores `raw` under the key a GET for `path` derives.
fn seed(store: &MemoryStore, path: &str, raw: Vec<u8>) -> CacheKey {
    let key = KeyDeriver::new().derive(&get(path).into_parts().0);
    store.insert(key.clone(), raw);
    key
}

fn page(content: &str) -> StoredPage {
    StoredPage::new(content).with_header("X-Magento-Tags", "cms_p_2")
}

async fn body(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn shared_hit_then_local_hit() {
    let store = MemoryStore::new();
    seed(&store, "/women.html", PayloadCodec::encode_native(&page("<h1>Women</h1>")).unwrap());

    let pipeline = Pipeline::builder(store.clone())
        .local_cache(LocalCache::new(LocalCacheConfig::default()))
        .debug_headers(true)
        .build();
    let service = FpcService::new(pipeline);

    let first = service.clone().oneshot(get("/women.html")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[FAST_CACHE_HEADER], "HIT");
    assert_eq!(first.headers()[CONTENT_TYPE], "text/html; charset=UTF-8");
    assert_eq!(first.headers()["x-magento-tags"], "cms_p_2");
    assert!(first.headers().contains_key("redis-time"));
    assert_eq!(body(first).await, "<h1>Women</h1>");

    let second = service.clone().oneshot(get("/women.html")).await.unwrap();
    assert_eq!(second.headers()[FAST_CACHE_HEADER], "HIT (LOCAL)");
    assert!(!second.headers().contains_key("redis-time"));
    assert_eq!(body(second).await, "<h1>Women</h1>");

    assert_eq!(store.reads(), 1);
}

#[tokio::test]
async fn miss_is_structured_not_cached_answer() {
    let pipeline = Pipeline::builder(MemoryStore::new()).debug_headers(true).build();
    let expected_key = pipeline
        .key_deriver()
        .derive(&get("/unknown").into_parts().0);

    let response = FpcService::new(pipeline).oneshot(get("/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(response.headers()[FAST_CACHE_HEADER], "MISS");
    assert_eq!(response.headers()[FPC_KEY_HEADER], expected_key.as_str());
    assert_eq!(body(response).await, NOT_CACHED_BODY);
}

#[tokio::test]
async fn store_outage_degrades_to_miss() {
    let store = MemoryStore::new();
    seed(&store, "/", PayloadCodec::encode_plain(&page("home")).unwrap());
    store.set_available(false);

    let pipeline = Pipeline::builder(store).debug_headers(true).build();
    let response = FpcService::new(pipeline).oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[FAST_CACHE_HEADER], "ERROR");
    assert!(response.headers().contains_key(FPC_ERROR_HEADER));
    assert_eq!(body(response).await, NOT_CACHED_BODY);
}

#[tokio::test]
async fn undecodable_payload_degrades_to_miss() {
    let store = MemoryStore::new();
    seed(&store, "/", b"gz!!!not-base64".to_vec());

    let pipeline = Pipeline::builder(store).debug_headers(true).build();
    let response = FpcService::new(pipeline).oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[FAST_CACHE_HEADER], "ERROR");
}

#[tokio::test]
async fn every_storage_form_is_served() {
    let forms = [
        ("/plain", PayloadCodec::encode_plain(&page("plain")).unwrap(), "plain"),
        ("/gz", PayloadCodec::encode_gzip_base64(&page("gz")).unwrap(), "gz"),
        ("/native", PayloadCodec::encode_native(&page("native")).unwrap(), "native"),
        (
            "/empty-headers",
            br#"{"content":"bare","headers":[]}"#.to_vec(),
            "bare",
        ),
    ];

    let store = MemoryStore::new();
    for (path, raw, _) in &forms {
        seed(&store, path, raw.clone());
    }
    let service = FpcService::new(Pipeline::new(store));

    for (path, _, content) in forms {
        let response = service.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "path {path}");
        assert_eq!(body(response).await, content);
    }
}

#[tokio::test]
async fn plain_payload_with_leading_whitespace_is_served() {
    let store = MemoryStore::new();
    seed(&store, "/", b"\r\n  {\"content\":\"padded\",\"headers\":[]}".to_vec());
    seed(&store, "/bom", b"\xEF\xBB\xBF{\"content\":\"bom\"}".to_vec());
    let service = FpcService::new(Pipeline::new(store));

    let response = service.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, "padded");

    let response = service.oneshot(get("/bom")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, "bom");
}

#[tokio::test]
async fn non_cacheable_requests_never_reach_the_store() {
    let store = MemoryStore::new();
    seed(&store, "/", PayloadCodec::encode_plain(&page("home")).unwrap());
    let service = FpcService::new(Pipeline::builder(store.clone()).debug_headers(true).build());

    let post = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("host", "shop.example")
        .body(())
        .unwrap();
    let forced = Request::get("/")
        .header("host", "shop.example")
        .header("x-fpc-refresh", "1")
        .body(())
        .unwrap();
    let ignored = get("/checkout/cart");

    for request in [post, forced, ignored] {
        let response = service.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[FAST_CACHE_HEADER], "FALSE");
    }
    assert_eq!(store.reads(), 0);
}

#[tokio::test]
async fn diagnostics_off_by_default() {
    let store = MemoryStore::new();
    seed(&store, "/", PayloadCodec::encode_plain(&page("home")).unwrap());
    let response = FpcService::new(Pipeline::new(store)).oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(FAST_CACHE_HEADER));
    assert!(!response.headers().contains_key(FPC_KEY_HEADER));
    assert!(!response.headers().contains_key("fpc-time"));
}

#[tokio::test]
async fn request_id_is_echoed_in_diagnostics() {
    let service = FpcService::new(Pipeline::builder(MemoryStore::new()).debug_headers(true).build());
    let request = Request::get("/")
        .header("host", "shop.example")
        .header("x-request-id", "edge-7")
        .body(())
        .unwrap();

    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "edge-7");
}

#[tokio::test]
async fn configured_miss_status_is_used() {
    let pipeline = Pipeline::builder(MemoryStore::new())
        .miss_status(StatusCode::SERVICE_UNAVAILABLE)
        .build();
    let response = FpcService::new(pipeline).oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body(response).await, NOT_CACHED_BODY);
}

#[tokio::test]
async fn vary_cookie_selects_a_different_page() {
    let store = MemoryStore::new();
    seed(&store, "/", PayloadCodec::encode_plain(&page("guest")).unwrap());
    let service = FpcService::new(Pipeline::new(store));

    let guest = service.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(guest.status(), StatusCode::OK);

    let customer = Request::get("/")
        .header("host", "shop.example")
        .header("cookie", "X-Magento-Vary=abc123; PHPSESSID=1")
        .body(())
        .unwrap();
    let response = service.oneshot(customer).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[cfg(feature = "minify")]
#[tokio::test]
async fn minified_page_is_kept_locally() {
    use std::sync::Arc;
    use std::time::Duration;

    let store = MemoryStore::new();
    let key = seed(&store, "/",
        PayloadCodec::encode_plain(&StoredPage::new("<div>\n   <p>hi</p>\n<!-- x --></div>")).unwrap(),
    );
    let pipeline = Pipeline::builder(store)
        .local_cache(LocalCache::new(
            LocalCacheConfig::default().with_ttl(Duration::from_secs(30)),
        ))
        .transform(Arc::new(HtmlMinifier))
        .build();
    let service = FpcService::new(pipeline.clone());

    let response = service.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(body(response).await, "<div> <p>hi</p> </div>");

    let entry = pipeline.local_cache().unwrap().get(&key).await.unwrap();
    assert!(entry.page.minified);
    assert_eq!(entry.page.content, "<div> <p>hi</p> </div>");

    let response = service.oneshot(get("/")).await.unwrap();
    assert_eq!(body(response).await, "<div> <p>hi</p> </div>");
}
