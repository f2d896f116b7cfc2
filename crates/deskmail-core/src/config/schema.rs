//! Configuration schema.
//!
//! Hierarchy: `Config` → `AppConfig`, `MessageConfig`, `RegistryConfig`,
//! `StoreConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! We use `#[serde(rename_all = "camelCase")]` to handle the conversion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::utils::{duration_or, parse_duration};

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.deskmail/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub app: AppConfig,
    pub message: MessageConfig,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Report every problem that prevents `serve` from starting.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut problems = Vec::new();

        if self.app.encryption_key.trim().is_empty() {
            problems.push(ConfigError::MissingEncryptionKey);
        }

        let m = &self.message;
        for (field, value) in [
            ("message.incomingQueueSize", m.incoming_queue_size),
            ("message.incomingQueueWorkers", m.incoming_queue_workers),
            ("message.outgoingQueueSize", m.outgoing_queue_size),
            ("message.outgoingQueueWorkers", m.outgoing_queue_workers),
        ] {
            if value == 0 {
                problems.push(ConfigError::Zero { field });
            }
        }

        for (field, value) in [
            ("message.outgoingScanInterval", &m.outgoing_scan_interval),
            ("message.stuckScanInterval", &m.stuck_scan_interval),
            ("message.stuckThreshold", &m.stuck_threshold),
            ("registry.shutdownTimeout", &self.registry.shutdown_timeout),
        ] {
            if parse_duration(value).is_none() {
                problems.push(ConfigError::Duration {
                    field,
                    value: value.clone(),
                });
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

// ─────────────────────────────────────────────
// App
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Secret used to seal inbox credentials at rest.
    pub encryption_key: String,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// `compact` or `json`.
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Message pipelines
// ─────────────────────────────────────────────

/// Sizing and timing of the ingestion and dispatch pipelines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageConfig {
    pub incoming_queue_size: usize,
    pub incoming_queue_workers: usize,
    /// Persist attempts before an inbound message is dropped.
    pub incoming_max_attempts: u32,
    pub outgoing_queue_size: usize,
    pub outgoing_queue_workers: usize,
    /// How often the dispatch feeder looks for pending messages.
    pub outgoing_scan_interval: String,
    /// How often claimed-but-unfinished messages are looked for.
    pub stuck_scan_interval: String,
    /// Claim age after which a message counts as stuck.
    pub stuck_threshold: String,
    /// Attempt ceiling applied when a message has no live channel to judge it.
    pub max_send_attempts: u32,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            incoming_queue_size: 5000,
            incoming_queue_workers: 10,
            incoming_max_attempts: 3,
            outgoing_queue_size: 5000,
            outgoing_queue_workers: 10,
            outgoing_scan_interval: "1s".to_string(),
            stuck_scan_interval: "1m".to_string(),
            stuck_threshold: "10m".to_string(),
            max_send_attempts: 5,
        }
    }
}

impl MessageConfig {
    pub fn outgoing_scan_interval(&self) -> Duration {
        duration_or(&self.outgoing_scan_interval, Duration::from_secs(1))
    }

    pub fn stuck_scan_interval(&self) -> Duration {
        duration_or(&self.stuck_scan_interval, Duration::from_secs(60))
    }

    pub fn stuck_threshold(&self) -> Duration {
        duration_or(&self.stuck_threshold, Duration::from_secs(600))
    }
}

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Upper bound on waiting for in-flight work when stopping an adapter.
    pub shutdown_timeout: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: "30s".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        duration_or(&self.shutdown_timeout, Duration::from_secs(30))
    }
}

// ─────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Snapshot file of the local store (`~` is expanded).
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.deskmail/store.json".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
