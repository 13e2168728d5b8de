use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::{BoxError, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tracing_subscriber::{fmt, EnvFilter};

use devgate::compute::{self, ComputeBackend};
use devgate::config;
use devgate::lifecycle::LifecycleManager;
use devgate::preview::{self, PreviewCache, PreviewProxy};
use devgate::reaper;
use devgate::routes;
use devgate::sftp::SftpPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Exit non-zero before binding anything if the environment is unusable.
    if let Err(message) = config::validate() {
        tracing::error!(%message, "configuration invalid");
        return Err(message.into());
    }

    let db_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let backend: Arc<dyn ComputeBackend> = if *config::LOCAL_MODE {
        tracing::info!("using local container backend");
        Arc::new(compute::LocalBackend::connect()?)
    } else {
        tracing::info!(api = %config::MACHINES_API_URL.as_str(), "using remote machines backend");
        Arc::new(compute::RemoteBackend::from_env()?)
    };

    let cache = Arc::new(PreviewCache::new(preview::CACHE_TTL));
    Arc::clone(&cache).spawn_purge_ticker();

    let manager = Arc::new(LifecycleManager::new(
        pool.clone(),
        Arc::clone(&backend),
        Arc::clone(&cache),
    ));

    // The backend is authoritative: correct stale rows, then destroy
    // anything the backend holds that no row references.
    if let Err(err) = manager.reconcile().await {
        tracing::error!(?err, "startup reconcile failed");
    }
    if let Err(err) = manager.sweep_orphans().await {
        tracing::error!(?err, "orphan sweep failed");
    }
    Arc::clone(&manager).spawn_reconcile_ticker();

    reaper::spawn(pool.clone(), Arc::clone(&manager));

    let sftp_pool = Arc::new(SftpPool::new());
    Arc::clone(&sftp_pool).spawn_sweeper();

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .merge(routes::public_routes())
        .route(
            "/metrics",
            axum::routing::get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::api_routes().layer(
            // Lifecycle routes are mounted below without this timeout: they
            // wait on machine state transitions bounded by their own
            // deadlines, and must never have that wait cut short.
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    StatusCode::GATEWAY_TIMEOUT
                }))
                .timeout(Duration::from_secs(60)),
        ))
        .merge(routes::lifecycle_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(Arc::clone(&manager)))
        .layer(Extension(Arc::clone(&sftp_pool)));

    let api_addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::API_PORT).parse()?;
    let preview_addr: SocketAddr = format!(
        "{}:{}",
        config::BIND_ADDRESS.as_str(),
        *config::PREVIEW_PORT
    )
    .parse()?;

    let proxy = Arc::new(PreviewProxy::new(
        pool.clone(),
        Arc::clone(&cache),
        Arc::clone(&manager),
    ));
    let preview_server = tokio::spawn(proxy.serve(preview_addr));

    tracing::info!(%api_addr, "api listening");
    let api_server = axum::Server::bind(&api_addr).serve(app.into_make_service());

    tokio::select! {
        result = api_server => result?,
        result = preview_server => result??,
    }

    Ok(())
}
