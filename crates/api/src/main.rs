//! LearnHub Billing API server

use std::net::SocketAddr;

use learnhub_api::{create_router, AppState, Config};
use learnhub_billing::BillingService;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting LearnHub Billing API");

    let config = Config::from_env()?;
    tracing::info!(bind_address = %config.bind_address, "Configuration loaded");

    let migration_pool = learnhub_shared::db::create_migration_pool(&config.database_url).await?;
    learnhub_shared::db::run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Migrations applied");

    let pool = learnhub_shared::db::create_pool(
        &config.database_url,
        config.database_max_connections,
    )
    .await?;
    tracing::info!("Database pool created");

    let billing = BillingService::from_pool(&config.billing, pool.clone())?;

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(billing, Some(pool), config);
    let app = create_router(state);

    tracing::info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,learnhub_api=debug,learnhub_billing=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
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
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
