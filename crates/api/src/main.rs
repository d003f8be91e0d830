use anyhow::Context;

use forgemes_api::app::{self, services::Runtime};
use forgemes_outbox::DispatcherConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgemes_observability::init();

    let config = DispatcherConfig::from_env().context("invalid outbox configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let admin_addr = std::env::var("ADMIN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    tracing::info!(
        workers = config.worker_count,
        claim_batch = config.claim_batch,
        http_concurrency = config.http_concurrency,
        "starting outbox dispatcher"
    );
    let runtime = Runtime::start(&database_url, config).await?;
    let router = app::build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("failed to bind {admin_addr}"))?;
    tracing::info!("admin listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}
