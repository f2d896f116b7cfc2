//! Config loader — reads `~/.deskmail/config.json`, merges env vars, and
//! applies legacy migrations.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.deskmail/config.json`
//! 3. Environment variables `DESKMAIL_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from the default path + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    load_config_from_path(&config_path)
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let mut raw: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    migrate_config(&mut raw);

    let config: Config = match serde_json::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to deserialize config: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Apply legacy config migrations.
///
/// Older configs spell the scan interval `messageOutoingScanInterval`; it is
/// honoured (with a warning) unless the correct key is also present.
fn migrate_config(raw: &mut serde_json::Value) {
    let Some(message) = raw.get_mut("message").and_then(|m| m.as_object_mut()) else {
        return;
    };

    for legacy in ["messageOutoingScanInterval", "messageOutgoingScanInterval"] {
        if let Some(val) = message.remove(legacy) {
            if message.contains_key("outgoingScanInterval") {
                warn!("ignoring message.{legacy}; message.outgoingScanInterval is set");
            } else {
                warn!("message.{legacy} is deprecated, use message.outgoingScanInterval");
                message.insert("outgoingScanInterval".to_string(), val);
            }
        }
    }
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `DESKMAIL_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `DESKMAIL_APP__ENCRYPTION_KEY` → `app.encryption_key`
/// - `DESKMAIL_APP__LOG_LEVEL` → `app.log_level`
/// - `DESKMAIL_APP__LOG_FORMAT` → `app.log_format`
/// - `DESKMAIL_MESSAGE__INCOMING_QUEUE_SIZE` / `__INCOMING_QUEUE_WORKERS`
/// - `DESKMAIL_MESSAGE__OUTGOING_QUEUE_SIZE` / `__OUTGOING_QUEUE_WORKERS`
/// - `DESKMAIL_MESSAGE__OUTGOING_SCAN_INTERVAL` / `__STUCK_THRESHOLD`
/// - `DESKMAIL_REGISTRY__SHUTDOWN_TIMEOUT` → `registry.shutdown_timeout`
/// - `DESKMAIL_STORE__PATH` → `store.path`
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(val) = std::env::var("DESKMAIL_APP__ENCRYPTION_KEY") {
        config.app.encryption_key = val;
    }
    if let Ok(val) = std::env::var("DESKMAIL_APP__LOG_LEVEL") {
        config.app.log_level = val;
    }
    if let Ok(val) = std::env::var("DESKMAIL_APP__LOG_FORMAT") {
        config.app.log_format = val;
    }

    let m = &mut config.message;
    env_usize("DESKMAIL_MESSAGE__INCOMING_QUEUE_SIZE", &mut m.incoming_queue_size);
    env_usize("DESKMAIL_MESSAGE__INCOMING_QUEUE_WORKERS", &mut m.incoming_queue_workers);
    env_usize("DESKMAIL_MESSAGE__OUTGOING_QUEUE_SIZE", &mut m.outgoing_queue_size);
    env_usize("DESKMAIL_MESSAGE__OUTGOING_QUEUE_WORKERS", &mut m.outgoing_queue_workers);
    if let Ok(val) = std::env::var("DESKMAIL_MESSAGE__OUTGOING_SCAN_INTERVAL") {
        m.outgoing_scan_interval = val;
    }
    if let Ok(val) = std::env::var("DESKMAIL_MESSAGE__STUCK_THRESHOLD") {
        m.stuck_threshold = val;
    }

    if let Ok(val) = std::env::var("DESKMAIL_REGISTRY__SHUTDOWN_TIMEOUT") {
        config.registry.shutdown_timeout = val;
    }
    if let Ok(val) = std::env::var("DESKMAIL_STORE__PATH") {
        config.store.path = val;
    }

    config
}

fn env_usize(name: &str, target: &mut usize) {
    if let Ok(val) = std::env::var(name) {
        match val.parse::<usize>() {
            Ok(n) => *target = n,
            Err(_) => warn!("ignoring {name}={val}: not a number"),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp_json(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_missing_file() {
        let config = load_config_from_path(Path::new("/nonexistent/path/config.json"));
        assert_eq!(config.message.incoming_queue_size, 5000);
    }

    #[test]
    fn test_load_valid_json() {
        let file = write_temp_json(
            r#"{
            "app": { "encryptionKey": "s3cret" },
            "message": { "outgoingQueueWorkers": 4 }
        }"#,
        );

        let config = load_config_from_path(file.path());
        assert_eq!(config.app.encryption_key, "s3cret");
        assert_eq!(config.message.outgoing_queue_workers, 4);
        assert_eq!(config.message.incoming_queue_workers, 10);
    }

    #[test]
    fn test_load_invalid_json_returns_defaults() {
        let file = write_temp_json("not valid json {{{");
        let config = load_config_from_path(file.path());
        assert_eq!(config.message.outgoing_queue_size, 5000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.store.path = "/var/lib/deskmail/store.json".to_string();
        save_config(&config, Some(&path)).unwrap();

        let reloaded = load_config_from_path(&path);
        assert_eq!(reloaded.store.path, "/var/lib/deskmail/store.json");
    }

    #[test]
    fn test_migrate_misspelled_scan_interval() {
        let file = write_temp_json(r#"{ "message": { "messageOutoingScanInterval": "250ms" } }"#);
        let config = load_config_from_path(file.path());
        assert_eq!(config.message.outgoing_scan_interval, "250ms");
    }

    #[test]
    fn test_migrate_no_overwrite() {
        let file = write_temp_json(
            r#"{ "message": {
                "outgoingScanInterval": "2s",
                "messageOutoingScanInterval": "250ms"
            } }"#,
        );
        let config = load_config_from_path(file.path());
        assert_eq!(config.message.outgoing_scan_interval, "2s");
    }

    #[test]
    fn test_env_override_encryption_key_and_workers() {
        std::env::set_var("DESKMAIL_APP__ENCRYPTION_KEY", "from-env");
        std::env::set_var("DESKMAIL_MESSAGE__INCOMING_QUEUE_WORKERS", "2");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.app.encryption_key, "from-env");
        assert_eq!(config.message.incoming_queue_workers, 2);
        std::env::remove_var("DESKMAIL_APP__ENCRYPTION_KEY");
        std::env::remove_var("DESKMAIL_MESSAGE__INCOMING_QUEUE_WORKERS");
    }

    #[test]
    fn test_saved_json_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        save_config(&Config::default(), Some(&path)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&content).unwrap();

        assert!(raw["message"].get("incomingQueueSize").is_some());
        assert!(raw["message"].get("incoming_queue_size").is_none());
    }
}
