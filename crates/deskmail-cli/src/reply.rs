//! `deskmail reply` — queue an agent reply from the shell.
//!
//! The message is stored as pending; a running or future `serve` picks it
//! up on its next outgoing scan.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use uuid::Uuid;

use deskmail_core::config::Config;
use deskmail_core::models::{ContentType, Message};
use deskmail_core::store::Store;
use deskmail_pipeline::{DispatchWaker, Outbox, ReplyDraft};

use crate::helpers;

pub async fn run(config: &Config, conversation: &str, agent: i64, body: String, html: bool) -> Result<()> {
    let store = helpers::open_store(config).await?;
    let message = queue_reply(store, conversation, agent, body, html).await?;
    println!(
        "  {} reply {} queued ({})",
        "✓".green(),
        message.id,
        message.message_id_header.as_deref().unwrap_or("-").dimmed()
    );
    Ok(())
}

async fn queue_reply(
    store: Arc<dyn Store>,
    conversation: &str,
    agent: i64,
    body: String,
    html: bool,
) -> Result<Message> {
    let uuid = Uuid::parse_str(conversation.trim())
        .with_context(|| format!("'{conversation}' is not a conversation UUID"))?;
    let conv = store
        .conversation_by_uuid(uuid)
        .await?
        .with_context(|| format!("conversation {uuid} not found"))?;

    let outbox = Outbox::new(store, DispatchWaker::default());
    let message = outbox
        .enqueue_reply(ReplyDraft {
            conversation_id: conv.id,
            agent_id: agent,
            content: body,
            content_type: if html { ContentType::Html } else { ContentType::Text },
            ..Default::default()
        })
        .await
        .context("failed to queue reply")?;
    Ok(message)
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
