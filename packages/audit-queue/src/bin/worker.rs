//! Audit Worker
//!
//! Claims jobs from Postgres and runs them until Ctrl-C, then drains running
//! jobs and pending webhook deliveries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audit_queue::{
    DispatcherConfig, HandlerRegistry, HandlerResult, InMemoryRegistrations, PostgresStore,
    ProgressReporter, WebhookDispatcher, WebhookNotifier, Worker, WorkerConfig,
};
use fetch_guard::{RateLimiter, SafeFetcher};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Payload of the built-in `site_probe` job.
#[derive(Debug, Deserialize)]
struct SiteProbe {
    url: String,
}

async fn site_probe(
    fetcher: Arc<SafeFetcher>,
    job: SiteProbe,
    progress: ProgressReporter,
) -> HandlerResult {
    progress
        .stage("validate", format!("checking {}", job.url), 10)
        .await?;
    let target = fetcher.check_url(&job.url).await?;

    progress
        .stage("fetch", format!("fetching {}", target.url), 40)
        .await?;
    let page = fetcher.fetch(&job.url).await?.error_for_status()?;

    progress.stage("summarize", "summarizing response", 90).await?;
    Ok(json!({
        "url": job.url,
        "final_url": page.final_url.to_string(),
        "status": page.status.as_u16(),
        "bytes": page.body.len(),
        "redirects": page.redirects,
        "remote_addr": page.remote_addr.to_string(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,audit_queue=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting audit worker");

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        worker_id = %config.worker_id,
        service_tier = %config.service_tier,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Configuration loaded"
    );

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections((config.max_concurrent_jobs as u32).saturating_mul(2).max(5))
        .acquire_timeout(Duration::from_secs(10))
        .connect(config.database_url.expose())
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresStore::new(pool).with_backoff(config.retry_backoff()));
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // Outbound HTTP: crawling is rate limited, webhook delivery is not
    let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
    let crawl_fetcher = Arc::new(
        SafeFetcher::new(config.fetch_config()).with_rate_limiter(limiter.clone()),
    );
    let webhook_fetcher = Arc::new(SafeFetcher::new(config.fetch_config()));

    let mut registry = HandlerRegistry::new();
    {
        let fetcher = crawl_fetcher.clone();
        registry
            .register_fn::<SiteProbe, _, _>("site_probe", move |job, progress| {
                site_probe(fetcher.clone(), job, progress)
            })
            .context("Failed to register site_probe handler")?;
    }

    let registrations = Arc::new(InMemoryRegistrations::new());
    if let Some(registration) = config.webhook_registration() {
        for job_type in registry.registered_types() {
            registrations
                .register_for_type(job_type, registration.clone())
                .await;
        }
        tracing::info!(url = %registration.url, "Webhook callback registered");
    }

    let dispatcher_config: DispatcherConfig = config.dispatcher_config();
    let dispatcher = Arc::new(WebhookDispatcher::new(
        webhook_fetcher,
        store.clone(),
        dispatcher_config,
    ));
    let notifier = Arc::new(WebhookNotifier::new(dispatcher, registrations));

    let worker = Worker::new(
        config.worker_settings(),
        store.clone(),
        store.clone(),
        Arc::new(registry),
    )
    .with_notifier(notifier);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await;
    limiter.close();

    tracing::info!("Audit worker stopped");
    Ok(())
}
