use std::time::Duration;

use anyhow::Result;
use loadout_core::config::{AppConfig, LoadOptions};
use loadout_server::api::{self, AppState};
use loadout_server::{bootstrap, health, worker};
use tokio::net::TcpListener;

fn init_logging(config: &AppConfig) {
    use loadout_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap emits its first event.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let engine = worker::spawn(app.runner.clone(), worker::PoolSettings::from(&app.config.engine));

    let router = api::router(AppState::new(app.repos.clone(), app.runner.clone()))
        .merge(health::router(app.db_pool.clone(), app.engine_summary.clone()));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        address = %address,
        workers = engine.worker_count(),
        dry_run = app.engine_summary.dry_run,
        "loadout-server started"
    );
    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(event_name = "system.server.stopping", "loadout-server stopping");
    engine.shutdown(Duration::from_secs(app.config.server.graceful_shutdown_secs)).await;
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            event_name = "system.server.signal_error",
            error = %error,
            "could not listen for shutdown signal"
        );
    }
}
