//! Local store — everything in memory behind one mutex, optionally
//! snapshotted to a JSON file after each mutation.
//!
//! Every mutation runs under the lock and is rolled back if the snapshot
//! cannot be written, so callers observe all-or-nothing semantics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Contacts, IngestOutcome, NewInbox, NewIncoming, NewOutgoing, Store};
use crate::error::StoreError;
use crate::models::{
    Agent, Contact, Conversation, ConversationStatus, Inbox, Message, MessageStatus,
    MessageType, SenderType,
};
use crate::utils::truncate_string;

/// Characters of the latest message kept on the conversation row.
const LAST_MESSAGE_PREVIEW: usize = 100;

/// First conversation reference number.
const REFERENCE_BASE: i64 = 100;

// ─────────────────────────────────────────────
// State
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    last_id: i64,
    inboxes: Vec<Inbox>,
    agents: Vec<Agent>,
    contacts: Vec<Contact>,
    conversations: Vec<Conversation>,
    /// Append-only, so vector order is id order.
    messages: Vec<Message>,
}

impl StoreState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn inbox_mut(&mut self, id: i64) -> Result<&mut Inbox, StoreError> {
        self.inboxes
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::not_found("inbox", id))
    }

    fn conversation_mut(&mut self, id: i64) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    /// The contact's most recently active non-closed conversation in `inbox_id`.
    fn latest_open(&self, inbox_id: i64, contact_id: i64) -> Option<&Conversation> {
        self.conversations
            .iter()
            .filter(|c| {
                c.inbox_id == inbox_id && c.contact_id == contact_id && !c.status.is_closed()
            })
            .max_by_key(|c| (c.last_message_at.unwrap_or(c.created_at), c.id))
    }

    fn new_conversation(&mut self, new: &NewIncoming, now: DateTime<Utc>) -> i64 {
        let id = self.next_id();
        let reference = REFERENCE_BASE + self.conversations.len() as i64;
        self.conversations.push(Conversation {
            id,
            uuid: Uuid::new_v4(),
            contact_id: new.contact_id,
            inbox_id: new.inbox_id,
            status: ConversationStatus::Open,
            assigned_user_id: None,
            assigned_team_id: None,
            priority: None,
            subject: new.subject.clone(),
            reference_number: reference.to_string(),
            last_message: String::new(),
            last_message_at: None,
            last_message_sender: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    fn pending_outgoing_mut(&mut self, id: i64) -> Result<&mut Message, StoreError> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found("message", id))?;
        if !msg.is_pending_outgoing() {
            return Err(StoreError::InvalidState(format!(
                "message {id} is {} and not a pending outgoing message",
                msg.status
            )));
        }
        Ok(msg)
    }
}

fn preview(text: &str, content: &str) -> String {
    let source = if text.trim().is_empty() { content } else { text };
    let flat: String = source.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_string(&flat, LAST_MESSAGE_PREVIEW)
}

// ─────────────────────────────────────────────
// LocalStore
// ─────────────────────────────────────────────

pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl LocalStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open a file-backed store, loading the snapshot if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let data = tokio::fs::read_to_string(&path).await?;
            let state: StoreState = serde_json::from_str(&data)?;
            info!(
                path = %path.display(),
                inboxes = state.inboxes.len(),
                messages = state.messages.len(),
                "loaded store snapshot"
            );
            state
        } else {
            debug!(path = %path.display(), "no store snapshot, starting empty");
            StoreState::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Run `f` under the lock and persist; restore the previous state on failure.
    async fn mutate<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<R, StoreError> + Send,
        R: Send,
    {
        let mut state = self.state.lock().await;
        let backup = self.path.as_ref().map(|_| state.clone());

        let result = match f(&mut *state) {
            Ok(r) => self.persist(&*state).await.map(|_| r),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Some(backup) = backup {
                *state = backup;
            }
        }
        result
    }

    async fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&StoreState) -> R,
    {
        let state = self.state.lock().await;
        f(&*state)
    }
}

#[async_trait]
impl Contacts for LocalStore {
    async fn find_or_create_contact(&self, email: &str, name: &str) -> Result<Contact, StoreError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(StoreError::InvalidState("contact email is empty".into()));
        }
        let name = name.trim().to_string();

        self.mutate(move |s| {
            if let Some(c) = s.contacts.iter().find(|c| c.email == email) {
                return Ok(c.clone());
            }
            let (first, last) = match name.split_once(' ') {
                Some((f, l)) => (f.to_string(), l.trim().to_string()),
                None if !name.is_empty() => (name.clone(), String::new()),
                None => (email.split('@').next().unwrap_or_default().to_string(), String::new()),
            };
            let contact = Contact {
                id: s.next_id(),
                email,
                first_name: first,
                last_name: last,
                created_at: Utc::now(),
            };
            s.contacts.push(contact.clone());
            Ok(contact)
        })
        .await
    }
}

#[async_trait]
impl Store for LocalStore {
    // ── inboxes ──

    async fn list_inboxes(&self) -> Result<Vec<Inbox>, StoreError> {
        Ok(self.read(|s| s.inboxes.clone()).await)
    }

    async fn get_inbox(&self, id: i64) -> Result<Inbox, StoreError> {
        self.read(|s| s.inboxes.iter().find(|i| i.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::not_found("inbox", id))
    }

    async fn create_inbox(&self, new: NewInbox) -> Result<Inbox, StoreError> {
        self.mutate(move |s| {
            let now = Utc::now();
            let inbox = Inbox {
                id: s.next_id(),
                name: new.name,
                channel: new.channel,
                enabled: new.enabled,
                from: new.from,
                config: new.config,
                last_error: None,
                deleted: false,
                created_at: now,
                updated_at: now,
            };
            s.inboxes.push(inbox.clone());
            Ok(inbox)
        })
        .await
    }

    async fn update_inbox_config(
        &self,
        id: i64,
        config: serde_json::Value,
    ) -> Result<Inbox, StoreError> {
        self.mutate(move |s| {
            let inbox = s.inbox_mut(id)?;
            inbox.config = config;
            inbox.updated_at = Utc::now();
            Ok(inbox.clone())
        })
        .await
    }

    async fn update_inbox_tokens(
        &self,
        id: i64,
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let expires_at = serde_json::to_value(expires_at)?;
        self.mutate(move |s| {
            let inbox = s.inbox_mut(id)?;
            let oauth = inbox
                .config
                .get_mut("oauth")
                .and_then(serde_json::Value::as_object_mut)
                .ok_or_else(|| {
                    StoreError::InvalidState(format!("inbox {id} has no oauth block"))
                })?;
            oauth.insert("access_token".into(), access_token.into());
            oauth.insert("refresh_token".into(), refresh_token.into());
            oauth.insert("expires_at".into(), expires_at);
            inbox.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_inbox_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        self.mutate(move |s| {
            let inbox = s.inbox_mut(id)?;
            inbox.enabled = enabled;
            inbox.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn delete_inbox(&self, id: i64) -> Result<(), StoreError> {
        self.mutate(move |s| {
            let inbox = s.inbox_mut(id)?;
            inbox.deleted = true;
            inbox.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_inbox_error(&self, id: i64, error: Option<String>) -> Result<(), StoreError> {
        self.mutate(move |s| {
            s.inbox_mut(id)?.last_error = error;
            Ok(())
        })
        .await
    }

    // ── agents & contacts ──

    async fn create_agent(
        &self,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<Agent, StoreError> {
        let (email, first_name, last_name) =
            (email.to_lowercase(), first_name.to_string(), last_name.to_string());
        self.mutate(move |s| {
            let agent = Agent {
                id: s.next_id(),
                email,
                first_name,
                last_name,
            };
            s.agents.push(agent.clone());
            Ok(agent)
        })
        .await
    }

    async fn get_agent(&self, id: i64) -> Result<Agent, StoreError> {
        self.read(|s| s.agents.iter().find(|a| a.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    async fn get_contact(&self, id: i64) -> Result<Contact, StoreError> {
        self.read(|s| s.contacts.iter().find(|c| c.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::not_found("contact", id))
    }

    // ── conversations ──

    async fn get_conversation(&self, id: i64) -> Result<Conversation, StoreError> {
        self.read(|s| s.conversations.iter().find(|c| c.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    async fn conversation_by_uuid(&self, uuid: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .read(|s| s.conversations.iter().find(|c| c.uuid == uuid).cloned())
            .await)
    }

    async fn conversation_by_message_id(
        &self,
        inbox_id: i64,
        header: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let header = header.trim();
        if header.is_empty() {
            return Ok(None);
        }
        Ok(self
            .read(|s| {
                let conv_id = s
                    .messages
                    .iter()
                    .rev()
                    .find(|m| {
                        m.inbox_id == inbox_id
                            && (m.message_id_header.as_deref() == Some(header)
                                || m.source_id.as_deref() == Some(header))
                    })
                    .map(|m| m.conversation_id)?;
                s.conversations.iter().find(|c| c.id == conv_id).cloned()
            })
            .await)
    }

    async fn latest_open_conversation(
        &self,
        inbox_id: i64,
        contact_id: i64,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .read(|s| s.latest_open(inbox_id, contact_id).cloned())
            .await)
    }

    async fn assign_conversation(&self, id: i64, user_id: i64) -> Result<(), StoreError> {
        self.mutate(move |s| {
            let conv = s.conversation_mut(id)?;
            conv.assigned_user_id = Some(user_id);
            conv.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        self.mutate(move |s| {
            let conv = s.conversation_mut(id)?;
            conv.status = status;
            conv.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    // ── messages ──

    async fn insert_incoming(&self, new: NewIncoming) -> Result<IngestOutcome, StoreError> {
        self.mutate(move |s| {
            let duplicate = s.messages.iter().any(|m| {
                m.inbox_id == new.inbox_id && m.source_id.as_deref() == Some(new.source_id.as_str())
            });
            if duplicate {
                return Ok(IngestOutcome::Duplicate);
            }

            let now = Utc::now();
            let received_at = new.received_at.unwrap_or(now);

            let (conversation_id, created) = match new.conversation_id {
                Some(id) => {
                    let conv = s.conversation_mut(id)?;
                    if conv.inbox_id != new.inbox_id {
                        return Err(StoreError::InvalidState(format!(
                            "conversation {id} belongs to inbox {}",
                            conv.inbox_id
                        )));
                    }
                    (id, false)
                }
                // a concurrent insert may have opened one since the caller looked
                None => match s.latest_open(new.inbox_id, new.contact_id).map(|c| c.id) {
                    Some(id) => (id, false),
                    None => (s.new_conversation(&new, now), true),
                },
            };

            let message = Message {
                id: s.next_id(),
                uuid: Uuid::new_v4(),
                conversation_id,
                inbox_id: new.inbox_id,
                message_type: MessageType::Incoming,
                status: MessageStatus::Received,
                sender_id: new.contact_id,
                sender_type: SenderType::Contact,
                content: new.content,
                content_type: new.content_type,
                text_content: new.text_content,
                subject: new.subject,
                from: new.from,
                to: new.to,
                cc: new.cc,
                bcc: Vec::new(),
                reply_to: None,
                source_id: Some(new.source_id),
                message_id_header: new.message_id_header,
                in_reply_to: new.in_reply_to,
                references: new.references,
                attachments: new.attachments,
                attempts: 0,
                last_error: None,
                next_attempt_at: None,
                claimed_at: None,
                sent_at: None,
                created_at: received_at,
                updated_at: now,
            };

            let conv = s.conversation_mut(conversation_id)?;
            conv.last_message = preview(&message.text_content, &message.content);
            conv.last_message_at = Some(received_at);
            conv.last_message_sender = Some(SenderType::Contact);
            conv.updated_at = now;
            if conv.status != ConversationStatus::Open {
                debug!(conversation = %conv.uuid, from = ?conv.status, "reopening conversation");
                conv.status = ConversationStatus::Open;
            }
            let conversation = conv.clone();

            s.messages.push(message.clone());
            Ok(IngestOutcome::Inserted {
                conversation,
                message,
                created,
            })
        })
        .await
    }

    async fn create_outgoing(&self, new: NewOutgoing) -> Result<Message, StoreError> {
        self.mutate(move |s| {
            let now = Utc::now();
            let inbox_id = s.conversation_mut(new.conversation_id)?.inbox_id;

            let message = Message {
                id: s.next_id(),
                uuid: Uuid::new_v4(),
                conversation_id: new.conversation_id,
                inbox_id,
                message_type: MessageType::Outgoing,
                status: MessageStatus::Pending,
                sender_id: new.sender_id,
                sender_type: SenderType::Agent,
                content: new.content,
                content_type: new.content_type,
                text_content: new.text_content,
                subject: new.subject,
                from: new.from,
                to: new.to,
                cc: new.cc,
                bcc: new.bcc,
                reply_to: new.reply_to,
                source_id: None,
                message_id_header: Some(new.message_id_header),
                in_reply_to: new.in_reply_to,
                references: new.references,
                attachments: new.attachments,
                attempts: 0,
                last_error: None,
                next_attempt_at: None,
                claimed_at: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            };

            let conv = s.conversation_mut(new.conversation_id)?;
            conv.last_message = preview(&message.text_content, &message.content);
            conv.last_message_at = Some(now);
            conv.last_message_sender = Some(SenderType::Agent);
            conv.updated_at = now;

            s.messages.push(message.clone());
            Ok(message)
        })
        .await
    }

    async fn get_message(&self, id: i64) -> Result<Message, StoreError> {
        self.read(|s| s.messages.iter().find(|m| m.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    async fn conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read(|s| {
                s.messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .await)
    }

    // ── dispatch bookkeeping ──

    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.mutate(move |s| {
            let mut seen = HashSet::new();
            let mut picks = Vec::new();
            for (idx, m) in s.messages.iter().enumerate() {
                if !m.is_pending_outgoing() || !seen.insert(m.conversation_id) {
                    continue;
                }
                // `m` is the oldest pending message of its conversation.
                if m.claimed_at.is_some() || m.next_attempt_at.is_some_and(|t| t > now) {
                    continue;
                }
                picks.push(idx);
                if picks.len() >= limit {
                    break;
                }
            }

            Ok(picks
                .into_iter()
                .map(|idx| {
                    let m = &mut s.messages[idx];
                    m.claimed_at = Some(now);
                    m.clone()
                })
                .collect())
        })
        .await
    }

    async fn reclaim_stuck(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        self.mutate(move |s| {
            Ok(s.messages
                .iter_mut()
                .filter(|m| m.is_pending_outgoing() && m.claimed_at.is_some_and(|t| t < older_than))
                .map(|m| {
                    m.claimed_at = Some(now);
                    m.clone()
                })
                .collect())
        })
        .await
    }

    async fn release_claims(&self) -> Result<usize, StoreError> {
        self.mutate(|s| {
            let mut released = 0;
            for m in s.messages.iter_mut().filter(|m| m.is_pending_outgoing()) {
                if m.claimed_at.take().is_some() {
                    released += 1;
                }
            }
            Ok(released)
        })
        .await
    }

    async fn begin_delivery(
        &self,
        id: i64,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.mutate(move |s| {
            let m = s
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| StoreError::not_found("message", id))?;
            if !m.is_pending_outgoing() || m.claimed_at.is_none() || m.attempts + 1 != attempt {
                return Ok(false);
            }
            m.claimed_at = Some(now);
            Ok(true)
        })
        .await
    }

    async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(move |s| {
            let m = s.pending_outgoing_mut(id)?;
            m.status = MessageStatus::Sent;
            m.attempts += 1;
            m.sent_at = Some(sent_at);
            m.claimed_at = None;
            m.next_attempt_at = None;
            m.last_error = None;
            m.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let error = error.to_string();
        self.mutate(move |s| {
            let m = s.pending_outgoing_mut(id)?;
            m.attempts += 1;
            m.last_error = Some(error);
            m.next_attempt_at = Some(next_attempt_at);
            m.claimed_at = None;
            m.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let error = error.to_string();
        self.mutate(move |s| {
            let m = s.pending_outgoing_mut(id)?;
            m.status = MessageStatus::Failed;
            m.attempts += 1;
            m.last_error = Some(error);
            m.claimed_at = None;
            m.next_attempt_at = None;
            m.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn retry_failed(&self, id: i64) -> Result<Message, StoreError> {
        self.mutate(move |s| {
            let m = s
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| StoreError::not_found("message", id))?;
            if m.message_type != MessageType::Outgoing || m.status != MessageStatus::Failed {
                return Err(StoreError::InvalidState(format!(
                    "message {id} is {} and cannot be retried",
                    m.status
                )));
            }
            m.status = MessageStatus::Pending;
            m.attempts = 0;
            m.next_attempt_at = None;
            m.claimed_at = None;
            m.updated_at = Utc::now();
            Ok(m.clone())
        })
        .await
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
