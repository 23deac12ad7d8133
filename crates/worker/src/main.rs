use std::sync::Arc;

use spool_dispatch::{orphan, DispatchConfig};
use spool_events::EventBus;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spool_worker=debug,spool_dispatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(DispatchConfig::from_env().expect("Invalid dispatch configuration"));
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = spool_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    spool_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    spool_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");

    let bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    let sweep = tokio::spawn(orphan::run(
        pool.clone(),
        Arc::clone(&config),
        Arc::clone(&bus),
        cancel.clone(),
    ));

    tracing::info!(
        scheduling_mode = %config.scheduling_mode,
        "Spool worker started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    if let Err(e) = sweep.await {
        tracing::error!(error = %e, "Orphan sweep task panicked");
    }
    pool.close().await;
    tracing::info!("Spool worker stopped");
}
