use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use reconflow::{
    api::{self, AppState},
    config::AppConfig,
    db,
    orchestrator::{Orchestrator, OrchestratorSettings},
    security::ScopeGuard,
    store::{RetryingStore, SqliteStore, StatusStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load()?;

    let pool = db::create_pool(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    db::run_migrations(&pool).await.context("failed to run migrations")?;

    let store = Arc::new(RetryingStore::new(
        Arc::new(SqliteStore::new(pool)),
        config.retry_policy(),
    ));
    let interrupted = store
        .fail_interrupted_jobs()
        .await
        .context("failed to mark interrupted jobs")?;
    if interrupted > 0 {
        warn!(interrupted, "jobs from a previous run were marked failed");
    }

    if ScopeGuard::new(&config.scope_allowlist).is_open() {
        warn!("scope allowlist is empty, every target is accepted");
    }

    let settings = OrchestratorSettings::from_config(&config);
    let orchestrator = Orchestrator::start(settings, store)
        .await
        .context("failed to start orchestrator")?;

    let app = api::router(AppState {
        orchestrator: orchestrator.clone(),
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "reconflow listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    info!("reconflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
