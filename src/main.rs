use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use dotenvy::dotenv;
use http::{HeaderMap, Uri};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tower_fpc::backend::redis::RedisStore;
use tower_fpc::config::{FpcConfig, LogFormat};
use tower_fpc::error::BoxError;
use tower_fpc::local::LocalCache;
use tower_fpc::origin::HttpOrigin;
use tower_fpc::transform::HtmlMinifier;
use tower_fpc::{AdminState, FpcService, Pipeline};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();

    let config = FpcConfig::from_env();
    init_tracing(config.log_format);
    config.validate()?;

    let store = RedisStore::connect(&config.redis_url())
        .await?
        .with_prefix(&config.prefix);

    let mut builder = Pipeline::builder(store)
        .classifier(config.classifier()?)
        .key_deriver(config.key_deriver())
        .miss_status(config.miss_status()?)
        .debug_headers(config.debug)
        .event_log(config.event_log_config())
        .revalidation(config.revalidator_config());
    if let Some(local) = config.local_cache_config() {
        builder = builder.local_cache(LocalCache::new(local));
    }
    if let Some(origin_url) = &config.origin_url {
        builder = builder.revalidate_with(
            Arc::new(HttpOrigin::new(origin_url)?),
            config.revalidator_config(),
        );
    }
    if config.minify {
        builder = builder.transform(Arc::new(HtmlMinifier));
    }
    let pipeline = builder.build();

    let mut app = Router::new();
    let admin_config = config.admin_config();
    if admin_config.enabled {
        let path = admin_config.mount_path.clone();
        let admin = AdminState::new(admin_config, pipeline.local_cache().cloned())
            .with_event_log(config.event_log_config());
        app = app.route(
            &path,
            get(move |headers: HeaderMap, uri: Uri| {
                let admin = admin.clone();
                async move { admin.handle(&headers, &uri) }
            }),
        );
    }
    let app = app.fallback_service(FpcService::new(pipeline.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        local_cache = config.use_local_cache,
        revalidation = pipeline.revalidator().is_some(),
        minify = config.minify,
        "fpc server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("tower_fpc=info,{}=info", env!("CARGO_CRATE_NAME")).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
