//! Event sinks — notify downstream consumers (automation rules, SLA
//! evaluation, live updates) about ingested conversations and messages.
//!
//! Delivery is best-effort: a failing sink is logged and never blocks or
//! fails ingestion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{Conversation, Message};

/// A consumer of ingestion events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A message started a brand-new conversation.
    async fn on_conversation_created(&self, conversation: &Conversation) -> anyhow::Result<()>;

    /// A message was appended to a conversation (new or existing).
    async fn on_message_ingested(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> anyhow::Result<()>;
}

/// Sink that only writes structured log lines.
pub struct LoggingSink;

#[async_trait]
impl EventSink for LoggingSink {
    async fn on_conversation_created(&self, conversation: &Conversation) -> anyhow::Result<()> {
        info!(
            conversation = %conversation.uuid,
            inbox_id = conversation.inbox_id,
            subject = %conversation.subject,
            "conversation created"
        );
        Ok(())
    }

    async fn on_message_ingested(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> anyhow::Result<()> {
        info!(
            conversation = %conversation.uuid,
            message = %message.uuid,
            "message ingested"
        );
        Ok(())
    }
}

/// Fans events out to every registered sink.
#[derive(Clone, Default)]
pub struct EventFanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventFanout {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub async fn conversation_created(&self, conversation: &Conversation) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_conversation_created(conversation).await {
                warn!(conversation = %conversation.uuid, error = %e, "event sink failed");
            }
        }
    }

    pub async fn message_ingested(&self, conversation: &Conversation, message: &Message) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_message_ingested(conversation, message).await {
                warn!(message = %message.uuid, error = %e, "event sink failed");
            }
        }
    }
}
