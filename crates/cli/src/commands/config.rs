use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use loadout_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// Renders the effective configuration, one line per key, with the layer
/// each value came from. Secrets never leave this function unredacted.
pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());
    let sources = Sources { file_doc: file_doc.as_ref(), file_path: file_path.as_deref() };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value) in entries(&config) {
        lines.push(format!("- {key} = {value} (source: {})", sources.of(&key, &env_key(&key))));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<(String, String)> {
    let mut entries = vec![
        ("database.url".to_string(), config.database.url.clone()),
        ("database.max_connections".to_string(), config.database.max_connections.to_string()),
        ("database.timeout_secs".to_string(), config.database.timeout_secs.to_string()),
        ("server.bind_address".to_string(), config.server.bind_address.clone()),
        ("server.port".to_string(), config.server.port.to_string()),
        (
            "server.graceful_shutdown_secs".to_string(),
            config.server.graceful_shutdown_secs.to_string(),
        ),
        ("engine.workers".to_string(), config.engine.workers.to_string()),
        ("engine.poll_interval_ms".to_string(), config.engine.poll_interval_ms.to_string()),
        ("engine.batch_size".to_string(), config.engine.batch_size.to_string()),
        ("engine.lease_secs".to_string(), config.engine.lease_secs.to_string()),
        ("engine.retry_base_secs".to_string(), config.engine.retry_base_secs.to_string()),
        ("engine.retry_max_secs".to_string(), config.engine.retry_max_secs.to_string()),
        ("engine.queue_capacity".to_string(), config.engine.queue_capacity.to_string()),
        ("providers.dry_run".to_string(), config.providers.dry_run.to_string()),
        (
            "providers.api_key".to_string(),
            redact_secret(config.providers.api_key.as_ref().map(|key| key.expose_secret())),
        ),
        ("providers.timeout_secs".to_string(), config.providers.timeout_secs.to_string()),
    ];

    for (channel, endpoint) in &config.providers.endpoints {
        entries.push((format!("providers.endpoints.{}", channel.as_str()), endpoint.clone()));
    }

    entries.extend([
        ("notifications.enabled".to_string(), config.notifications.enabled.to_string()),
        (
            "notifications.signing_secret".to_string(),
            redact_secret(
                config.notifications.signing_secret.as_ref().map(|secret| secret.expose_secret()),
            ),
        ),
        ("logging.level".to_string(), config.logging.level.clone()),
        ("logging.format".to_string(), format!("{:?}", config.logging.format).to_lowercase()),
    ]);
    entries
}

fn env_key(key_path: &str) -> String {
    match key_path.strip_prefix("providers.endpoints.") {
        Some(channel) => format!("LOADOUT_PROVIDERS_{}_URL", channel.to_ascii_uppercase()),
        None => format!("LOADOUT_{}", key_path.replace('.', "_").to_ascii_uppercase()),
    }
}

struct Sources<'a> {
    file_doc: Option<&'a Value>,
    file_path: Option<&'a Path>,
}

impl Sources<'_> {
    fn of(&self, key_path: &str, env_key: &str) -> String {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }

        if self.file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
            let file_path = self
                .file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }

        "default".to_string()
    }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("loadout.toml"), PathBuf::from("config/loadout.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_secret(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(value) => match value.split_once('_').or_else(|| value.split_once('-')) {
            Some((prefix, _)) if prefix.len() <= 6 => format!("{prefix}_***"),
            _ => "<redacted>".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, env_key, redact_secret};

    #[test]
    fn secrets_keep_only_a_short_prefix() {
        assert_eq!(redact_secret(None), "<unset>");
        assert_eq!(redact_secret(Some("  ")), "<empty>");
        assert_eq!(redact_secret(Some("whsec_abc123")), "whsec_***");
        assert_eq!(redact_secret(Some("opaquevalue")), "<redacted>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc = "[providers.endpoints]\nemail = \"https://mail.example\"\n"
            .parse::<Value>()
            .expect("toml");

        assert!(contains_path(&doc, "providers.endpoints.email"));
        assert!(!contains_path(&doc, "providers.endpoints.sms"));
    }

    #[test]
    fn env_keys_follow_the_loader_naming() {
        assert_eq!(env_key("engine.lease_secs"), "LOADOUT_ENGINE_LEASE_SECS");
        assert_eq!(env_key("providers.endpoints.sms"), "LOADOUT_PROVIDERS_SMS_URL");
    }
}
