use std::env;
use std::sync::{Mutex, OnceLock};

use loadout_cli::commands::{config, doctor, migrate, presets, seed, start};
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn start_passes_preflight_in_dry_run_mode() {
    let db = TempDir::new().expect("tempdir");
    with_env(&[("LOADOUT_DATABASE_URL", database_url(&db).as_str())], || {
        let result = start::run();
        assert_eq!(result.exit_code, 0, "expected successful start preflight");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "start");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().contains("dry-run"));
    });
}

#[test]
fn start_rejects_live_mode_without_endpoints() {
    let db = TempDir::new().expect("tempdir");
    let url = database_url(&db);
    with_env(
        &[("LOADOUT_DATABASE_URL", url.as_str()), ("LOADOUT_PROVIDERS_DRY_RUN", "false")],
        || {
            let result = start::run();
            assert_eq!(result.exit_code, 6, "expected provider readiness failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "provider_readiness");
        },
    );
}

#[test]
fn start_returns_config_failure_on_invalid_override() {
    with_env(&[("LOADOUT_ENGINE_WORKERS", "many")], || {
        let result = start::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "start");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn migrate_is_repeatable() {
    let db = TempDir::new().expect("tempdir");
    with_env(&[("LOADOUT_DATABASE_URL", database_url(&db).as_str())], || {
        let first = migrate::run();
        assert_eq!(first.exit_code, 0, "expected successful migrate run");
        let second = migrate::run();
        assert_eq!(second.exit_code, 0, "expected second migrate run to be a no-op");

        let payload = parse_payload(&second.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn seed_loads_the_demo_tenant_and_is_idempotent() {
    let db = TempDir::new().expect("tempdir");
    with_env(&[("LOADOUT_DATABASE_URL", database_url(&db).as_str())], || {
        let first = seed::run();
        assert_eq!(first.exit_code, 0, "expected first seed invocation success: {}", first.output);
        let first_payload = parse_payload(&first.output);
        let message = first_payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("tenant-demo"));
        assert!(message.contains("LO-demo-saas"));
        assert!(message.contains("C-demo-hot"));

        let second = seed::run();
        assert_eq!(second.exit_code, 0, "expected second seed invocation success");
        assert_eq!(first_payload["message"], parse_payload(&second.output)["message"]);
    });
}

#[test]
fn doctor_reports_schema_after_migrate() {
    let db = TempDir::new().expect("tempdir");
    with_env(&[("LOADOUT_DATABASE_URL", database_url(&db).as_str())], || {
        let before = parse_payload(&doctor::run(true));
        assert_eq!(before["overall_status"], "fail", "schema is not applied yet");

        assert_eq!(migrate::run().exit_code, 0);

        let after = parse_payload(&doctor::run(true));
        assert_eq!(after["overall_status"], "pass");
        let names = after["checks"]
            .as_array()
            .expect("checks array")
            .iter()
            .map(|check| check["name"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            ["config_validation", "provider_readiness", "database_connectivity", "schema_version"]
        );
    });
}

#[test]
fn doctor_skips_downstream_checks_when_config_fails() {
    with_env(&[("LOADOUT_DATABASE_MAX_CONNECTIONS", "zero")], || {
        let output = doctor::run(false);

        assert!(output.starts_with("doctor: one or more readiness checks failed"));
        assert!(output.contains("- [fail] config_validation"));
        assert!(output.contains("- [skip] database_connectivity"));
    });
}

#[test]
fn config_attributes_env_overrides_and_redacts_secrets() {
    with_env(
        &[
            ("LOADOUT_SERVER_PORT", "9191"),
            ("LOADOUT_NOTIFICATIONS_ENABLED", "true"),
            ("LOADOUT_NOTIFICATIONS_SIGNING_SECRET", "whsec_topsecretvalue"),
        ],
        || {
            let output = config::run();

            assert!(output.contains("- server.port = 9191 (source: env (LOADOUT_SERVER_PORT))"));
            assert!(output.contains("- engine.workers = 4 (source: default)"));
            assert!(output.contains("notifications.signing_secret = whsec_***"));
            assert!(!output.contains("topsecretvalue"));
        },
    );
}

#[test]
fn presets_filter_by_industry() {
    let result = presets::run("", Some("saas"));
    assert_eq!(result.exit_code, 0);

    let listing = parse_payload(&result.output);
    let entries = listing.as_array().expect("preset list");
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|entry| entry["industry"] == "saas"));
}

#[test]
fn presets_report_no_match() {
    let result = presets::run("no-such-preset-anywhere", None);
    assert_eq!(result.exit_code, 1);
    assert_eq!(parse_payload(&result.output)["error_class"], "not_found");
}

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("loadout.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "LOADOUT_DATABASE_URL",
        "LOADOUT_DATABASE_MAX_CONNECTIONS",
        "LOADOUT_DATABASE_TIMEOUT_SECS",
        "LOADOUT_SERVER_BIND_ADDRESS",
        "LOADOUT_SERVER_PORT",
        "LOADOUT_ENGINE_WORKERS",
        "LOADOUT_PROVIDERS_DRY_RUN",
        "LOADOUT_PROVIDERS_API_KEY",
        "LOADOUT_NOTIFICATIONS_ENABLED",
        "LOADOUT_NOTIFICATIONS_SIGNING_SECRET",
        "LOADOUT_LOGGING_LEVEL",
        "LOADOUT_LOGGING_FORMAT",
        "LOADOUT_LOG_LEVEL",
        "LOADOUT_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
