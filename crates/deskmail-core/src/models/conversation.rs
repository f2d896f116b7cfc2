//! Conversations, messages, contacts, and agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationStatus {
    #[default]
    Open,
    Replied,
    Resolved,
    Closed,
    Snoozed,
}

impl ConversationStatus {
    /// Closed conversations are skipped when matching by contact.
    pub fn is_closed(self) -> bool {
        self == ConversationStatus::Closed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Incoming,
    Outgoing,
    Activity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Received,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Agent,
    Contact,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Html,
}

// ─────────────────────────────────────────────
// People
// ─────────────────────────────────────────────

/// An external customer, identified by email address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

/// A helpdesk user who replies to conversations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl Agent {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

// ─────────────────────────────────────────────
// Conversation
// ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub uuid: Uuid,
    pub contact_id: i64,
    pub inbox_id: i64,
    pub status: ConversationStatus,
    pub assigned_user_id: Option<i64>,
    pub assigned_team_id: Option<i64>,
    pub priority: Option<String>,
    pub subject: String,
    pub reference_number: String,
    pub last_message: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_sender: Option<SenderType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_unassigned(&self) -> bool {
        self.assigned_user_id.is_none() && self.assigned_team_id.is_none()
    }
}

// ─────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// `inline` or `attachment`.
    pub disposition: String,
    #[serde(default)]
    pub content_id: Option<String>,
    pub size: usize,
    #[serde(default)]
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub uuid: Uuid,
    pub conversation_id: i64,
    pub inbox_id: i64,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: ContentType,
    /// Plain-text alternative of `content` when it is HTML.
    #[serde(default)]
    pub text_content: String,
    pub subject: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Mailbox-native dedup key; unique per inbox when set.
    pub source_id: Option<String>,
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_pending_outgoing(&self) -> bool {
        self.message_type == MessageType::Outgoing && self.status == MessageStatus::Pending
    }
}
