use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixelq_horde::HordeClient;
use pixelq_worker::config::WorkerConfig;
use pixelq_worker::driver::Driver;
use pixelq_worker::store::{JobEvent, JobRecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pixelq_worker=debug,pixelq_horde=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        api_url = %config.horde.api_url,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = pixelq_db::create_pool(&config.database_url)
        .await
        .context("Failed to open database")?;
    pixelq_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    pixelq_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Job store ---
    let store = Arc::new(
        JobRecordStore::load(pool.clone())
            .await
            .context("Failed to load jobs")?,
    );

    // --- Remote API ---
    let api = Arc::new(HordeClient::new(&config.horde).context("Failed to build API client")?);

    // --- Driver ---
    let handle = Driver::new(Arc::clone(&store), api, &config.scheduler)
        .start()
        .await;

    // Log job changes until shutdown.
    let mut events = store.subscribe();
    let cancel = handle.cancellation_token();
    let event_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(JobEvent::Updated(job)) => tracing::info!(
                        job_id = %job.id,
                        status = %job.status,
                        completed = job.images_completed,
                        failed = job.images_failed,
                        "Job updated",
                    ),
                    Ok(JobEvent::Deleted(id)) => tracing::info!(job_id = %id, "Job deleted"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Job event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    shutdown_signal().await?;
    tracing::info!("Shutdown requested");

    handle.shutdown().await;
    let _ = event_log.await;
    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    Ok(())
}
