//! Outbox — turns an agent reply into a pending outgoing message.
//!
//! The reply threads under the customer's latest inbound message, carries
//! a plus-addressed Reply-To when the inbox enables it, and ends with the
//! inbox signature. The dispatcher is woken so the message goes out
//! without waiting for the next scan.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use deskmail_channels::email::compose::generate_message_id;
use deskmail_channels::email::parse::html_to_text;
use deskmail_core::models::{
    Agent, Attachment, Contact, ContentType, ConversationStatus, Inbox, Message, MessageType,
};
use deskmail_core::store::{NewOutgoing, Store};
use deskmail_core::utils::extract_email_address;
use deskmail_core::{ChannelError, StoreError};

use crate::dispatch::DispatchWaker;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("reply body is empty")]
    EmptyBody,
}

/// An agent's reply as written in the UI.
#[derive(Clone, Debug, Default)]
pub struct ReplyDraft {
    pub conversation_id: i64,
    pub agent_id: i64,
    pub content: String,
    pub content_type: ContentType,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<Attachment>,
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

/// `Re: ` prefix unless the subject already has one.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// `local+conv-{uuid}@domain` for the inbox address in `from`. Any
/// existing `+tag` is replaced.
pub fn plus_address(from: &str, conversation: Uuid) -> Option<String> {
    let addr = extract_email_address(from);
    let (local, domain) = addr.rsplit_once('@')?;
    let base = local.split('+').next().unwrap_or(local);
    if base.is_empty() || domain.is_empty() {
        return None;
    }
    Some(format!("{base}+conv-{conversation}@{domain}"))
}

/// Fill the `{{inbox.*}}`, `{{agent.*}}` and `{{customer.*}}` placeholders.
pub fn render_signature(template: &str, inbox: &Inbox, agent: &Agent, customer: &Contact) -> String {
    [
        ("{{inbox.name}}", inbox.name.as_str()),
        ("{{agent.first_name}}", agent.first_name.as_str()),
        ("{{agent.last_name}}", agent.last_name.as_str()),
        ("{{agent.full_name}}", agent.full_name().as_str()),
        ("{{agent.email}}", agent.email.as_str()),
        ("{{customer.first_name}}", customer.first_name.as_str()),
        ("{{customer.last_name}}", customer.last_name.as_str()),
    ]
    .iter()
    .fold(template.to_string(), |acc, (placeholder, value)| {
        acc.replace(placeholder, value)
    })
}

/// In-Reply-To and References for a reply to `parent`.
fn threading(parent: Option<&Message>) -> (Option<String>, Vec<String>) {
    let Some(parent) = parent else {
        return (None, Vec::new());
    };
    let mut references = parent.references.clone();
    if let Some(id) = &parent.message_id_header {
        if !references.contains(id) {
            references.push(id.clone());
        }
    }
    (parent.message_id_header.clone(), references)
}

// ─────────────────────────────────────────────
// Outbox
// ─────────────────────────────────────────────

pub struct Outbox {
    store: Arc<dyn Store>,
    waker: DispatchWaker,
}

impl Outbox {
    pub fn new(store: Arc<dyn Store>, waker: DispatchWaker) -> Self {
        Self { store, waker }
    }

    /// Store `draft` as a pending outgoing message and wake the dispatcher.
    pub async fn enqueue_reply(&self, draft: ReplyDraft) -> Result<Message, OutboxError> {
        if draft.content.trim().is_empty() {
            return Err(OutboxError::EmptyBody);
        }

        let conversation = self.store.get_conversation(draft.conversation_id).await?;
        let inbox = self.store.get_inbox(conversation.inbox_id).await?;
        let config = inbox.email_config()?;
        let agent = self.store.get_agent(draft.agent_id).await?;
        let customer = self.store.get_contact(conversation.contact_id).await?;

        let from = if config.from.trim().is_empty() {
            inbox.from.clone()
        } else {
            config.from.clone()
        };
        if extract_email_address(&from).is_empty() {
            return Err(ChannelError::Config(format!("inbox {} has no from address", inbox.id)).into());
        }

        let history = self.store.conversation_messages(conversation.id).await?;
        let parent = history
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::Incoming);
        let (in_reply_to, references) = threading(parent);

        let mut content = draft.content.clone();
        if !config.signature.trim().is_empty() {
            let signature = render_signature(&config.signature, &inbox, &agent, &customer);
            match draft.content_type {
                ContentType::Html => content = format!("{content}<br><br>{signature}"),
                ContentType::Text => {
                    content = format!("{content}\n\n{}", html_to_text(&signature))
                }
            }
        }
        let text_content = match draft.content_type {
            ContentType::Html => html_to_text(&content),
            ContentType::Text => content.clone(),
        };

        let reply_to = if config.enable_plus_addressing {
            plus_address(&from, conversation.uuid)
        } else {
            None
        };

        let message = self
            .store
            .create_outgoing(NewOutgoing {
                conversation_id: conversation.id,
                sender_id: agent.id,
                message_id_header: generate_message_id(&from),
                from,
                to: vec![customer.email.clone()],
                cc: draft.cc,
                bcc: draft.bcc,
                reply_to,
                subject: reply_subject(&conversation.subject),
                content,
                content_type: draft.content_type,
                text_content,
                in_reply_to,
                references,
                attachments: draft.attachments,
            })
            .await?;

        if config.auto_assign_on_reply && conversation.is_unassigned() {
            self.store
                .assign_conversation(conversation.id, agent.id)
                .await?;
            debug!(conversation = %conversation.uuid, agent_id = agent.id, "auto-assigned on reply");
        }
        self.store
            .set_conversation_status(conversation.id, ConversationStatus::Replied)
            .await?;

        info!(
            conversation = %conversation.uuid,
            message_id = message.id,
            agent_id = agent.id,
            "reply queued"
        );
        self.waker.wake();
        Ok(message)
    }

    /// Manual agent retry of a failed outgoing message.
    pub async fn retry_failed(&self, message_id: i64) -> Result<Message, OutboxError> {
        let message = self.store.retry_failed(message_id).await?;
        info!(message_id, "failed message re-queued");
        self.waker.wake();
        Ok(message)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
