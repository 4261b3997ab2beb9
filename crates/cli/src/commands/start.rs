use loadout_core::config::AppConfig;
use loadout_core::domain::agent::Channel;
use loadout_db::{connect_with_settings, migrations};

use crate::commands::{block_on, load_config, CommandResult};

/// Preflight for `loadout-server`: the same config, database and provider
/// checks the server runs before it starts accepting work.
pub fn run() -> CommandResult {
    let config = match load_config("start") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    if let Err(message) = provider_readiness(&config) {
        return CommandResult::failure("start", "provider_readiness", message, 6);
    }

    let result = block_on("start", async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "start",
            format!(
                "preflight passed: {} workers, {} providers, listening on {}:{}",
                config.engine.workers,
                if config.providers.dry_run { "dry-run" } else { "live" },
                config.server.bind_address,
                config.server.port
            ),
        ),
        Err(failure) => failure,
    }
}

pub(crate) fn provider_readiness(config: &AppConfig) -> Result<Vec<Channel>, String> {
    if config.providers.dry_run {
        return Ok(Channel::ALL.to_vec());
    }

    let served = config.providers.endpoints.keys().copied().collect::<Vec<_>>();
    if served.is_empty() {
        return Err("live mode requires at least one provider endpoint".to_string());
    }
    Ok(served)
}
