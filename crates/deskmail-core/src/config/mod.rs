//! Configuration system — schema, loading, and env var overrides.
//!
//! # Usage
//! ```no_run
//! use deskmail_core::config;
//!
//! let cfg = config::load_config(None);
//! println!("Ingest workers: {}", cfg.message.incoming_queue_workers);
//! ```

pub mod loader;
pub mod schema;

// Re-export key types
pub use loader::{get_config_path, load_config, save_config};
pub use schema::{AppConfig, Config, MessageConfig, RegistryConfig, StoreConfig};
