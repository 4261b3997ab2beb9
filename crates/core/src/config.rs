use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::agent::Channel;
use crate::execution_engine::ExecutionEngineConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub providers: ProvidersConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub lease_secs: i64,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct ProvidersConfig {
    /// Record dispatches locally instead of calling any endpoint.
    pub dry_run: bool,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
    pub default_max_concurrency: usize,
    pub endpoints: BTreeMap<Channel, String>,
    pub max_concurrency: BTreeMap<Channel, usize>,
}

#[derive(Clone, Debug)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub signing_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub dry_run: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://loadout.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            engine: EngineConfig {
                workers: 4,
                poll_interval_ms: 1_000,
                batch_size: 50,
                lease_secs: 300,
                retry_base_secs: 30,
                retry_max_secs: 3_600,
                queue_capacity: 256,
            },
            providers: ProvidersConfig {
                dry_run: true,
                api_key: None,
                timeout_secs: 10,
                default_max_concurrency: 4,
                endpoints: BTreeMap::new(),
                max_concurrency: BTreeMap::new(),
            },
            notifications: NotificationsConfig {
                enabled: true,
                signing_secret: None,
                timeout_secs: 5,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl EngineConfig {
    pub fn execution(&self) -> ExecutionEngineConfig {
        ExecutionEngineConfig {
            lease_seconds: self.lease_secs,
            retry_base_delay_seconds: self.retry_base_secs,
            retry_max_delay_seconds: self.retry_max_secs,
            ..ExecutionEngineConfig::default()
        }
    }
}

impl ProvidersConfig {
    pub fn concurrency_for(&self, channel: Channel) -> usize {
        self.max_concurrency.get(&channel).copied().unwrap_or(self.default_max_concurrency)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = LoadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(LoadError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, LoadError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("loadout.toml"));
            return Err(LoadError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(workers) = engine.workers {
                self.engine.workers = workers;
            }
            if let Some(poll_interval_ms) = engine.poll_interval_ms {
                self.engine.poll_interval_ms = poll_interval_ms;
            }
            if let Some(batch_size) = engine.batch_size {
                self.engine.batch_size = batch_size;
            }
            if let Some(lease_secs) = engine.lease_secs {
                self.engine.lease_secs = lease_secs;
            }
            if let Some(retry_base_secs) = engine.retry_base_secs {
                self.engine.retry_base_secs = retry_base_secs;
            }
            if let Some(retry_max_secs) = engine.retry_max_secs {
                self.engine.retry_max_secs = retry_max_secs;
            }
            if let Some(queue_capacity) = engine.queue_capacity {
                self.engine.queue_capacity = queue_capacity;
            }
        }

        if let Some(providers) = patch.providers {
            if let Some(dry_run) = providers.dry_run {
                self.providers.dry_run = dry_run;
            }
            if let Some(provider_api_key_value) = providers.api_key {
                self.providers.api_key = Some(secret_value(provider_api_key_value));
            }
            if let Some(timeout_secs) = providers.timeout_secs {
                self.providers.timeout_secs = timeout_secs;
            }
            if let Some(default_max_concurrency) = providers.default_max_concurrency {
                self.providers.default_max_concurrency = default_max_concurrency;
            }
            self.providers.endpoints.extend(providers.endpoints);
            self.providers.max_concurrency.extend(providers.max_concurrency);
        }

        if let Some(notifications) = patch.notifications {
            if let Some(enabled) = notifications.enabled {
                self.notifications.enabled = enabled;
            }
            if let Some(signing_secret_value) = notifications.signing_secret {
                self.notifications.signing_secret = Some(secret_value(signing_secret_value));
            }
            if let Some(timeout_secs) = notifications.timeout_secs {
                self.notifications.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), LoadError> {
        if let Some(value) = read_env("LOADOUT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LOADOUT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("LOADOUT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("LOADOUT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LOADOUT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LOADOUT_SERVER_PORT") {
            self.server.port = parse_env("LOADOUT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("LOADOUT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("LOADOUT_ENGINE_WORKERS") {
            self.engine.workers = parse_env("LOADOUT_ENGINE_WORKERS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_POLL_INTERVAL_MS") {
            self.engine.poll_interval_ms = parse_env("LOADOUT_ENGINE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_BATCH_SIZE") {
            self.engine.batch_size = parse_env("LOADOUT_ENGINE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_LEASE_SECS") {
            self.engine.lease_secs = parse_env("LOADOUT_ENGINE_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_RETRY_BASE_SECS") {
            self.engine.retry_base_secs = parse_env("LOADOUT_ENGINE_RETRY_BASE_SECS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_RETRY_MAX_SECS") {
            self.engine.retry_max_secs = parse_env("LOADOUT_ENGINE_RETRY_MAX_SECS", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_ENGINE_QUEUE_CAPACITY") {
            self.engine.queue_capacity = parse_env("LOADOUT_ENGINE_QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("LOADOUT_PROVIDERS_DRY_RUN") {
            self.providers.dry_run = parse_env("LOADOUT_PROVIDERS_DRY_RUN", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_PROVIDERS_API_KEY") {
            self.providers.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LOADOUT_PROVIDERS_TIMEOUT_SECS") {
            self.providers.timeout_secs = parse_env("LOADOUT_PROVIDERS_TIMEOUT_SECS", &value)?;
        }
        for channel in Channel::ALL {
            let key = format!("LOADOUT_PROVIDERS_{}_URL", channel.as_str().to_ascii_uppercase());
            if let Some(value) = read_env(&key) {
                self.providers.endpoints.insert(channel, value);
            }
        }

        if let Some(value) = read_env("LOADOUT_NOTIFICATIONS_ENABLED") {
            self.notifications.enabled = parse_env("LOADOUT_NOTIFICATIONS_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LOADOUT_NOTIFICATIONS_SIGNING_SECRET") {
            self.notifications.signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("LOADOUT_NOTIFICATIONS_TIMEOUT_SECS") {
            self.notifications.timeout_secs =
                parse_env("LOADOUT_NOTIFICATIONS_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("LOADOUT_LOGGING_LEVEL").or_else(|| read_env("LOADOUT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LOADOUT_LOGGING_FORMAT").or_else(|| read_env("LOADOUT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(workers) = overrides.workers {
            self.engine.workers = workers;
        }
        if let Some(dry_run) = overrides.dry_run {
            self.providers.dry_run = dry_run;
        }
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_engine(&self.engine)?;
        validate_providers(&self.providers)?;
        validate_notifications(&self.notifications)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("loadout.toml"), PathBuf::from("config/loadout.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, LoadError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| LoadError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| LoadError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, LoadError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(LoadError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| LoadError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), LoadError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(LoadError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(LoadError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(LoadError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), LoadError> {
    if server.port == 0 {
        return Err(LoadError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(LoadError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), LoadError> {
    if engine.workers == 0 || engine.queue_capacity == 0 || engine.batch_size == 0 {
        return Err(LoadError::Validation(
            "engine.workers, engine.queue_capacity and engine.batch_size must be positive"
                .to_string(),
        ));
    }

    if engine.poll_interval_ms < 10 {
        return Err(LoadError::Validation(
            "engine.poll_interval_ms must be at least 10".to_string(),
        ));
    }

    if engine.lease_secs <= 0 || engine.retry_base_secs < 0 {
        return Err(LoadError::Validation(
            "engine.lease_secs must be positive and engine.retry_base_secs non-negative"
                .to_string(),
        ));
    }

    if engine.retry_max_secs < engine.retry_base_secs {
        return Err(LoadError::Validation(
            "engine.retry_max_secs must not be below engine.retry_base_secs".to_string(),
        ));
    }

    Ok(())
}

fn validate_providers(providers: &ProvidersConfig) -> Result<(), LoadError> {
    if providers.timeout_secs == 0 || providers.timeout_secs > 300 {
        return Err(LoadError::Validation(
            "providers.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if providers.default_max_concurrency == 0
        || providers.max_concurrency.values().any(|limit| *limit == 0)
    {
        return Err(LoadError::Validation(
            "providers max concurrency limits must be greater than zero".to_string(),
        ));
    }

    for (channel, url) in &providers.endpoints {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(LoadError::Validation(format!(
                "providers.endpoints.{channel} must start with http:// or https://"
            )));
        }
    }

    if !providers.dry_run && !providers.endpoints.is_empty() {
        let missing_key = providers
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_key {
            return Err(LoadError::Validation(
                "providers.api_key is required when provider endpoints are configured".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_notifications(notifications: &NotificationsConfig) -> Result<(), LoadError> {
    if notifications.timeout_secs == 0 || notifications.timeout_secs > 60 {
        return Err(LoadError::Validation(
            "notifications.timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    let empty_secret = notifications
        .signing_secret
        .as_ref()
        .is_some_and(|secret| secret.expose_secret().trim().is_empty());
    if empty_secret {
        return Err(LoadError::Validation(
            "notifications.signing_secret must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), LoadError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(LoadError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, LoadError> {
    value.trim().parse::<T>().map_err(|_| LoadError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    engine: Option<EnginePatch>,
    providers: Option<ProvidersPatch>,
    notifications: Option<NotificationsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    batch_size: Option<u32>,
    lease_secs: Option<i64>,
    retry_base_secs: Option<i64>,
    retry_max_secs: Option<i64>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersPatch {
    dry_run: Option<bool>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    default_max_concurrency: Option<usize>,
    #[serde(default)]
    endpoints: BTreeMap<Channel, String>,
    #[serde(default)]
    max_concurrency: BTreeMap<Channel, usize>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsPatch {
    enabled: Option<bool>,
    signing_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigOverrides, LoadError, LoadOptions, LogFormat};
    use crate::domain::agent::Channel;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_load_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.providers.dry_run, "dry run is the default")?;
        ensure(config.engine.workers == 4, "four workers by default")?;
        ensure(config.providers.concurrency_for(Channel::Sms) == 4, "default channel limit")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_LOADOUT_PROVIDER_KEY", "pk-from-env");
        env::set_var("TEST_LOADOUT_SIGNING_SECRET", "whsec-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("loadout.toml");
            fs::write(
                &path,
                r#"
[providers]
dry_run = false
api_key = "${TEST_LOADOUT_PROVIDER_KEY}"

[providers.endpoints]
email = "https://mail.example.test/dispatch"

[providers.max_concurrency]
sms = 2

[notifications]
signing_secret = "${TEST_LOADOUT_SIGNING_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.providers.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("pk-from-env".to_string()),
                "provider key should be loaded from environment",
            )?;
            ensure(
                config.notifications.signing_secret.as_ref().map(|s| s.expose_secret().to_string())
                    == Some("whsec-from-env".to_string()),
                "signing secret should be loaded from environment",
            )?;
            ensure(
                config.providers.endpoints.get(&Channel::Email).map(String::as_str)
                    == Some("https://mail.example.test/dispatch"),
                "email endpoint should come from the file",
            )?;
            ensure(config.providers.concurrency_for(Channel::Sms) == 2, "sms limit from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_LOADOUT_PROVIDER_KEY", "TEST_LOADOUT_SIGNING_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOADOUT_LOG_LEVEL", "warn");
        env::set_var("LOADOUT_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["LOADOUT_LOG_LEVEL", "LOADOUT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOADOUT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LOADOUT_ENGINE_WORKERS", "6");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("loadout.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[engine]
workers = 2
batch_size = 10

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.engine.workers == 6, "env worker count should win over the file")?;
            ensure(config.engine.batch_size == 10, "file batch size should win over defaults")?;
            Ok(())
        })();

        clear_vars(&["LOADOUT_DATABASE_URL", "LOADOUT_ENGINE_WORKERS"]);
        result
    }

    #[test]
    fn invalid_env_override_is_reported_with_its_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOADOUT_SERVER_PORT", "eighty");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected override failure".to_string()),
                Err(error) => error,
            };
            let names_key = matches!(
                error,
                LoadError::InvalidEnvOverride { ref key, .. } if key == "LOADOUT_SERVER_PORT"
            );
            ensure(names_key, "error should name the offending variable")
        })();

        clear_vars(&["LOADOUT_SERVER_PORT"]);
        result
    }

    #[test]
    fn live_endpoints_require_an_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOADOUT_PROVIDERS_DRY_RUN", "false");
        env::set_var("LOADOUT_PROVIDERS_SMS_URL", "https://sms.example.test");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                LoadError::Validation(ref message) if message.contains("providers.api_key")
            );
            ensure(has_message, "validation failure should mention providers.api_key")
        })();

        clear_vars(&["LOADOUT_PROVIDERS_DRY_RUN", "LOADOUT_PROVIDERS_SMS_URL"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOADOUT_PROVIDERS_API_KEY", "pk-secret-value");
        env::set_var("LOADOUT_NOTIFICATIONS_SIGNING_SECRET", "whsec-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("pk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("whsec-secret-value"),
                "debug output should not contain signing secret",
            )?;
            Ok(())
        })();

        clear_vars(&["LOADOUT_PROVIDERS_API_KEY", "LOADOUT_NOTIFICATIONS_SIGNING_SECRET"]);
        result
    }
}
