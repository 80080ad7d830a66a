//! LearnHub billing worker

use learnhub_billing::BillingService;
use learnhub_worker::{webhook_processor, SettlementRunner, WorkerConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,learnhub_worker=debug,learnhub_billing=debug"));
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting LearnHub billing worker");

    let config = WorkerConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    let pool =
        learnhub_shared::db::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    let billing = BillingService::from_pool(&config.billing, pool)?;

    let mut scheduler = JobScheduler::new().await?;

    let runner = SettlementRunner::new(billing.settlement.clone());
    scheduler
        .add(Job::new_async(config.settlement_cron.as_str(), move |_id, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.tick().await;
            })
        })?)
        .await?;

    let sweeper = billing.webhooks.clone();
    scheduler
        .add(Job::new_async(config.webhook_sweep_cron.as_str(), move |_id, _lock| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                webhook_processor::process_webhook_queue(&sweeper).await;
            })
        })?)
        .await?;

    let purger = billing.webhooks.clone();
    scheduler
        .add(Job::new_async(config.webhook_purge_cron.as_str(), move |_id, _lock| {
            let purger = purger.clone();
            Box::pin(async move {
                webhook_processor::cleanup_old_webhooks(&purger).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!(
        settlement = %config.settlement_cron,
        webhook_sweep = %config.webhook_sweep_cron,
        webhook_purge = %config.webhook_purge_cron,
        "Jobs scheduled"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler");

    scheduler.shutdown().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
