//! Shared CLI helpers — path expansion, store opening, banner and log printing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;

use deskmail_core::config::Config;
use deskmail_core::models::Inbox;
use deskmail_core::store::LocalStore;

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Open the file-backed store named by `store.path`.
pub async fn open_store(config: &Config) -> Result<Arc<LocalStore>> {
    let path = expand_tilde(&config.store.path);
    let store = LocalStore::open(&path)
        .await
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Short state label for an inbox row.
pub fn inbox_state(inbox: &Inbox, running: bool) -> String {
    if inbox.last_error.is_some() {
        "error".red().to_string()
    } else if running {
        "running".green().to_string()
    } else if inbox.enabled {
        "enabled".green().to_string()
    } else {
        "disabled".dimmed().to_string()
    }
}

/// Print the banner shown when serving.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("{}  v{}", "📬 Deskmail".cyan().bold(), version.dimmed());
    println!();
}

/// Print a diagnostics step log under a heading.
pub fn print_step_log(title: &str, lines: &[String]) {
    println!("  {}", title.bold());
    for line in lines {
        println!("    {}", line.dimmed());
    }
    println!();
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
