//! Messages flowing between channel adapters and the pipelines.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Attachment, ContentType, Message};
use crate::utils::{extract_display_name, extract_email_address};

// ─────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────

/// Headers the thread resolver and store care about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageHeaders {
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Oldest first, as they appear in the header.
    pub references: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub delivered_to: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
}

/// An email fetched by an adapter, not yet resolved to a conversation.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub inbox_id: i64,
    /// Mailbox-native dedup key.
    pub source_id: String,
    pub headers: MessageHeaders,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    /// Times the ingestion pipeline has already tried to persist this message.
    pub attempts: u32,
}

impl RawMessage {
    pub fn new(inbox_id: i64, source_id: impl Into<String>, headers: MessageHeaders) -> Self {
        Self {
            inbox_id,
            source_id: source_id.into(),
            headers,
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
            received_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn sender_email(&self) -> String {
        extract_email_address(&self.headers.from)
    }

    pub fn sender_name(&self) -> String {
        extract_display_name(&self.headers.from)
    }

    /// Every address this message was delivered to, lowercased.
    pub fn recipients(&self) -> impl Iterator<Item = String> + '_ {
        self.headers
            .to
            .iter()
            .chain(self.headers.cc.iter())
            .chain(self.headers.delivered_to.iter())
            .map(|a| extract_email_address(a))
    }

    /// Preferred stored body and its type: HTML when present, else text.
    pub fn content(&self) -> (String, ContentType) {
        match (&self.html_body, &self.text_body) {
            (Some(html), _) if !html.trim().is_empty() => (html.clone(), ContentType::Html),
            (_, Some(text)) => (text.clone(), ContentType::Text),
            _ => (String::new(), ContentType::Text),
        }
    }

    /// Reject messages the pipeline cannot attribute or deduplicate.
    pub fn validate(&self) -> Result<(), String> {
        if self.source_id.trim().is_empty() {
            return Err("missing source id".into());
        }
        let sender = self.sender_email();
        if sender.is_empty() || !sender.contains('@') {
            return Err(format!("unusable From header '{}'", self.headers.from));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────

/// A pending outgoing message handed to a channel's `send`.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: i64,
    pub uuid: Uuid,
    pub inbox_id: i64,
    pub conversation_id: i64,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub content: String,
    pub content_type: ContentType,
    pub text_content: String,
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<Attachment>,
    /// 1-based number of this delivery attempt.
    pub attempt: u32,
}

impl From<&Message> for OutgoingMessage {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id,
            uuid: m.uuid,
            inbox_id: m.inbox_id,
            conversation_id: m.conversation_id,
            from: m.from.clone(),
            to: m.to.clone(),
            cc: m.cc.clone(),
            bcc: m.bcc.clone(),
            reply_to: m.reply_to.clone(),
            subject: m.subject.clone(),
            content: m.content.clone(),
            content_type: m.content_type,
            text_content: m.text_content.clone(),
            message_id_header: m.message_id_header.clone(),
            in_reply_to: m.in_reply_to.clone(),
            references: m.references.clone(),
            attachments: m.attachments.clone(),
            attempt: m.attempts + 1,
        }
    }
}

impl OutgoingMessage {
    /// Envelope recipients: To, Cc and Bcc.
    pub fn envelope_recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|a| extract_email_address(a))
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// What a successful `send` reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id_header: String,
    pub accepted: Vec<String>,
}
