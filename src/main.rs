use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use meter_ingest::config::Config;
use meter_ingest::db;
use meter_ingest::downsample::Downsampler;
use meter_ingest::presence::PresenceTracker;
use meter_ingest::retention::RetentionManager;
use meter_ingest::rollup::RollupEngine;
use meter_ingest::scheduler::Scheduler;
use meter_ingest::store::{PgTelemetryStore, TelemetryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".to_string());
    let cfg = Config::load(&config_path)?;
    info!(config = %config_path, "configuration loaded");

    let pool = db::create_pool(
        &cfg.database.url,
        cfg.database.max_connections.unwrap_or(10),
    )
    .await?;
    info!("connected to database");

    let store: Arc<dyn TelemetryStore> = Arc::new(PgTelemetryStore::new(pool));
    let presence = Arc::new(PresenceTracker::new(
        cfg.presence.online_timeout_ms,
        cfg.presence.evict_after_ms,
    ));
    let downsampler = Arc::new(Downsampler::new(cfg.ingest.persist_every_nth));
    let rollup = Arc::new(RollupEngine::new(
        Arc::clone(&store),
        cfg.rollup.tariff_per_kwh,
    ));
    let retention = Arc::new(RetentionManager::new(
        Arc::clone(&store),
        cfg.retention.min_age_hours,
    ));

    let scheduler = Arc::new(Scheduler::new(
        &cfg,
        Arc::clone(&store),
        Arc::clone(&presence),
        Arc::clone(&downsampler),
        Arc::clone(&rollup),
        Arc::clone(&retention),
    )?);

    scheduler.catch_up().await;
    let handles = scheduler.spawn_all();
    info!(jobs = handles.len(), "maintenance jobs running");

    shutdown_signal().await;
    info!("shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
