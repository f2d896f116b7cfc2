//! Persistence seam.
//!
//! The engine only talks to storage through [`Store`] and [`Contacts`].
//! [`LocalStore`] is the bundled implementation (in-memory with an optional
//! JSON snapshot); a SQL-backed store implements the same traits.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Agent, Attachment, ChannelKind, Contact, ContentType, Conversation, ConversationStatus,
    Inbox, Message,
};

pub use local::LocalStore;

// ─────────────────────────────────────────────
// Request / result types
// ─────────────────────────────────────────────

/// Fields for a new inbox.
#[derive(Clone, Debug)]
pub struct NewInbox {
    pub name: String,
    pub channel: ChannelKind,
    pub enabled: bool,
    pub from: String,
    pub config: serde_json::Value,
}

/// An inbound message ready to be persisted.
#[derive(Clone, Debug, Default)]
pub struct NewIncoming {
    pub inbox_id: i64,
    pub contact_id: i64,
    /// Existing conversation to append to. `None` appends to the contact's
    /// latest open conversation in the inbox, or creates one.
    pub conversation_id: Option<i64>,
    pub subject: String,
    pub source_id: String,
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub content: String,
    pub content_type: ContentType,
    pub text_content: String,
    pub attachments: Vec<Attachment>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Result of [`Store::insert_incoming`].
#[derive(Clone, Debug)]
pub enum IngestOutcome {
    Inserted {
        conversation: Conversation,
        message: Message,
        /// Whether the conversation was created by this insert.
        created: bool,
    },
    /// `(inbox_id, source_id)` already exists; nothing was written.
    Duplicate,
}

/// An agent reply to be stored as a pending outgoing message.
#[derive(Clone, Debug, Default)]
pub struct NewOutgoing {
    pub conversation_id: i64,
    pub sender_id: i64,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub content: String,
    pub content_type: ContentType,
    pub text_content: String,
    pub message_id_header: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<Attachment>,
}

// ─────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────

/// Contact directory.
#[async_trait]
pub trait Contacts: Send + Sync {
    /// Look up a contact by email (case-insensitive), creating it if absent.
    async fn find_or_create_contact(&self, email: &str, name: &str) -> Result<Contact, StoreError>;
}

/// Everything the engine persists.
#[async_trait]
pub trait Store: Contacts {
    // ── inboxes ──

    /// All inboxes, including disabled and soft-deleted ones.
    async fn list_inboxes(&self) -> Result<Vec<Inbox>, StoreError>;
    async fn get_inbox(&self, id: i64) -> Result<Inbox, StoreError>;
    async fn create_inbox(&self, new: NewInbox) -> Result<Inbox, StoreError>;
    async fn update_inbox_config(
        &self,
        id: i64,
        config: serde_json::Value,
    ) -> Result<Inbox, StoreError>;
    /// Overwrite the token fields of the inbox's `oauth` block in place. Other
    /// config keys keep whatever value is stored at the time of the write.
    async fn update_inbox_tokens(
        &self,
        id: i64,
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn set_inbox_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError>;
    async fn delete_inbox(&self, id: i64) -> Result<(), StoreError>;
    async fn set_inbox_error(&self, id: i64, error: Option<String>) -> Result<(), StoreError>;

    // ── agents & contacts ──

    async fn create_agent(
        &self,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<Agent, StoreError>;
    async fn get_agent(&self, id: i64) -> Result<Agent, StoreError>;
    async fn get_contact(&self, id: i64) -> Result<Contact, StoreError>;

    // ── conversations ──

    async fn get_conversation(&self, id: i64) -> Result<Conversation, StoreError>;
    async fn conversation_by_uuid(&self, uuid: Uuid) -> Result<Option<Conversation>, StoreError>;
    /// Conversation owning a message whose Message-ID (or source id) is `header`.
    async fn conversation_by_message_id(
        &self,
        inbox_id: i64,
        header: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Most recently active non-closed conversation for contact + inbox.
    async fn latest_open_conversation(
        &self,
        inbox_id: i64,
        contact_id: i64,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn assign_conversation(&self, id: i64, user_id: i64) -> Result<(), StoreError>;
    async fn set_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<(), StoreError>;

    // ── messages ──

    /// Atomically create the conversation (if needed) and message.
    async fn insert_incoming(&self, incoming: NewIncoming) -> Result<IngestOutcome, StoreError>;
    async fn create_outgoing(&self, outgoing: NewOutgoing) -> Result<Message, StoreError>;
    async fn get_message(&self, id: i64) -> Result<Message, StoreError>;
    /// Messages of a conversation, oldest first.
    async fn conversation_messages(&self, conversation_id: i64)
        -> Result<Vec<Message>, StoreError>;

    // ── dispatch bookkeeping ──

    /// Claim up to `limit` due pending outgoing messages.
    ///
    /// Only the oldest pending message of a conversation is eligible, and
    /// only while no other message of that conversation is claimed.
    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>)
        -> Result<Vec<Message>, StoreError>;
    /// Re-claim pending messages whose claim is older than `older_than`.
    async fn reclaim_stuck(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError>;
    /// Drop every outstanding claim (used at dispatcher start-up).
    async fn release_claims(&self) -> Result<usize, StoreError>;
    /// Start delivery attempt number `attempt` of a claimed message and
    /// restamp its claim at `now`.
    ///
    /// False when the message was already settled, released, or attempted
    /// since it was queued. Such a queue entry is a stale duplicate.
    async fn begin_delivery(
        &self,
        id: i64,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError>;
    /// Put a failed outgoing message back to pending with a fresh attempt budget.
    async fn retry_failed(&self, id: i64) -> Result<Message, StoreError>;
}
