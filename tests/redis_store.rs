#![cfg(feature = "redis-store")]

use http::{Request, StatusCode};
use http_body_util::BodyExt;
use redis::AsyncCommands;
use redis::Client;
use tower::ServiceExt;
use tower_fpc::backend::namespaced_key;
use tower_fpc::prelude::*;

#[tokio::test]
async fn reads_pages_written_by_the_storefront() -> Result<(), Box<dyn std::error::Error>> {
    let redis_url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping redis integration test: set REDIS_URL");
            return Ok(());
        }
    };

    let prefix = "tower_fpc_test_";
    let request = || {
        Request::get("/redis.html")
            .header("host", "shop.example")
            .body(())
            .unwrap()
    };
    let key = KeyDeriver::new().derive(&request().into_parts().0);
    let hash = namespaced_key(prefix, &key);

    let client = Client::open(redis_url.clone())?;
    let mut conn = client.get_connection_manager().await?;
    let payload = PayloadCodec::encode_native(
        &StoredPage::new("<p>from redis</p>").with_header("X-Magento-Tags", "cms_b"),
    )?;
    conn.hset::<_, _, _, ()>(&hash, "d", payload).await?;

    let store = RedisStore::connect(&redis_url).await?.with_prefix(prefix);
    assert!(store.get(&key).await?.is_some());

    let service = FpcService::new(Pipeline::new(store.clone()));
    let response = service.oneshot(request()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-magento-tags"], "cms_b");
    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"<p>from redis</p>");

    conn.del::<_, ()>(&hash).await?;
    assert!(store.get(&key).await?.is_none());
    Ok(())
}
