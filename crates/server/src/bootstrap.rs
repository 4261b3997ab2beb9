use std::sync::Arc;

use loadout_core::clock::SystemClock;
use loadout_core::config::{AppConfig, LoadError, LoadOptions};
use loadout_core::execution_engine::CursorEngine;
use loadout_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::health::EngineSummary;
use crate::notify::WebhookNotifier;
use crate::providers::ProviderRegistry;
use crate::runner::{ChainRunner, Repositories};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub repos: Repositories,
    pub runner: Arc<ChainRunner>,
    pub engine_summary: EngineSummary,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects, migrates and wires the runtime for an already loaded config.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let providers =
        ProviderRegistry::from_config(&config.providers).map_err(BootstrapError::HttpClient)?;
    let notifier =
        WebhookNotifier::from_config(&config.notifications).map_err(BootstrapError::HttpClient)?;
    let engine_summary = EngineSummary {
        workers: config.engine.workers.max(1),
        provider_channels: providers.channels(),
        dry_run: config.providers.dry_run,
    };
    info!(
        event_name = "system.bootstrap.providers_ready",
        dry_run = config.providers.dry_run,
        channels = providers.channels().len(),
        "action providers registered"
    );

    let repos = Repositories::sql(&db_pool);
    let runner = Arc::new(ChainRunner::new(
        repos.clone(),
        Arc::new(providers),
        Arc::new(notifier),
        Arc::new(SystemClock),
        CursorEngine::with_config(config.engine.execution()),
    ));

    Ok(Application { config, db_pool, repos, runner, engine_summary })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use loadout_core::config::{ConfigOverrides, LoadOptions};
    use loadout_core::domain::agent::Channel;

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn in_memory() -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_registers_dry_run_providers() {
        let app = bootstrap(in_memory()).await.expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('loadout', 'execution_cursor', 'dispatch_ledger')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables");
        assert_eq!(table_count, 3);

        assert!(app.engine_summary.dry_run);
        assert_eq!(app.engine_summary.provider_channels.len(), Channel::ALL.len());

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_a_missing_required_config_file() {
        let result = bootstrap(LoadOptions {
            config_path: Some(PathBuf::from("/nonexistent/loadout.toml")),
            require_file: true,
            ..in_memory()
        })
        .await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
