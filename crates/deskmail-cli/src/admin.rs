//! `deskmail inboxes`, `add-inbox`, `add-agent` — store administration.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Deserialize;

use deskmail_core::config::Config;
use deskmail_core::crypto::CredentialCipher;
use deskmail_core::models::{redact_inbox, ChannelKind, EmailConfig, Inbox};
use deskmail_core::store::{NewInbox, Store};

use crate::helpers;

/// On-disk shape accepted by `add-inbox`. Secrets are plaintext.
#[derive(Debug, Deserialize)]
struct InboxFile {
    name: String,
    from: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    config: EmailConfig,
}

fn enabled_by_default() -> bool {
    true
}

// ─────────────────────────────────────────────
// inboxes
// ─────────────────────────────────────────────

pub async fn list_inboxes(config: &Config, json: bool) -> Result<()> {
    let store = helpers::open_store(config).await?;
    let inboxes: Vec<Inbox> = store.list_inboxes().await?.iter().map(redact_inbox).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&inboxes)?);
        return Ok(());
    }

    println!();
    println!("{}", "📬 Inboxes".cyan().bold());
    println!();
    if inboxes.is_empty() {
        println!("  {}", "No inboxes. Create one with `deskmail add-inbox`.".dimmed());
        println!();
        return Ok(());
    }

    println!(
        "  {:<5} {:<20} {:<8} {:<10} {}",
        "ID".bold(),
        "Name".bold(),
        "Type".bold(),
        "State".bold(),
        "From".bold()
    );
    for inbox in &inboxes {
        println!(
            "  {:<5} {:<20} {:<8} {:<10} {}",
            inbox.id,
            inbox.name,
            inbox.channel.to_string(),
            helpers::inbox_state(inbox, false),
            inbox.from
        );
        if let Some(err) = &inbox.last_error {
            println!("        {}", err.red());
        }
    }
    println!();
    Ok(())
}

// ─────────────────────────────────────────────
// add-inbox / add-agent
// ─────────────────────────────────────────────

pub async fn add_inbox(config: &Config, file: &Path) -> Result<()> {
    let inbox = create_inbox_from_file(config, file).await?;
    println!("  {} inbox {} ({})", "✓".green(), inbox.id, inbox.name);
    Ok(())
}

async fn create_inbox_from_file(config: &Config, file: &Path) -> Result<Inbox> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed: InboxFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid inbox file {}", file.display()))?;

    let mut email = parsed.config;
    email.trim();
    email.validate().context("invalid email config")?;

    let cipher = CredentialCipher::new(&config.app.encryption_key)
        .context("app.encryptionKey is required to store credentials")?;
    let sealed = cipher
        .seal_email_config(&email)
        .context("failed to seal credentials")?;

    let store = helpers::open_store(config).await?;
    let inbox = store
        .create_inbox(NewInbox {
            name: parsed.name,
            channel: ChannelKind::Email,
            enabled: parsed.enabled,
            from: parsed.from,
            config: serde_json::to_value(&sealed)?,
        })
        .await?;
    Ok(inbox)
}

pub async fn add_agent(config: &Config, email: &str, first_name: &str, last_name: &str) -> Result<()> {
    let store = helpers::open_store(config).await?;
    let agent = store.create_agent(email, first_name, last_name).await?;
    println!("  {} agent {} <{}>", "✓".green(), agent.id, agent.email);
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
