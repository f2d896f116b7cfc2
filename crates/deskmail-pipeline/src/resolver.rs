//! Thread resolution — which conversation does an inbound email continue?
//!
//! Rules, first match wins:
//! 1. plus-addressed recipient `local+conv-{uuid}@domain` (when enabled)
//! 2. `In-Reply-To`, then `References` newest first, against stored
//!    Message-IDs of this inbox
//! 3. the sender's most recent non-closed conversation in this inbox
//!
//! Otherwise the message starts a new conversation.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use deskmail_core::bus::RawMessage;
use deskmail_core::models::{Contact, Conversation, EmailConfig};
use deskmail_core::store::Store;
use deskmail_core::StoreError;

static PLUS_CONV: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\+conv-([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})@").ok()
});

/// Which rule produced a [`Resolution`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchedBy {
    PlusAddress,
    InReplyTo,
    References,
    Contact,
    New,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    /// The sender, created if unknown.
    pub contact: Contact,
    /// `None` means a new conversation must be created.
    pub conversation: Option<Conversation>,
    pub matched_by: MatchedBy,
    /// Deduplication key within the inbox.
    pub dedup_key: String,
}

/// Conversation UUID embedded in a plus-addressed recipient.
pub fn plus_address_uuid(address: &str) -> Option<Uuid> {
    let caps = PLUS_CONV.as_ref()?.captures(address)?;
    Uuid::parse_str(caps.get(1)?.as_str()).ok()
}

pub struct ThreadResolver {
    store: Arc<dyn Store>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        raw: &RawMessage,
        config: &EmailConfig,
    ) -> Result<Resolution, StoreError> {
        let (conversation, matched_by) = match self.match_thread(raw, config).await? {
            Some((conv, rule)) => (Some(conv), rule),
            None => (None, MatchedBy::New),
        };

        let contact = self
            .store
            .find_or_create_contact(&raw.sender_email(), &raw.sender_name())
            .await?;

        let (conversation, matched_by) = match conversation {
            Some(conv) => (Some(conv), matched_by),
            None => match self
                .store
                .latest_open_conversation(raw.inbox_id, contact.id)
                .await?
            {
                Some(conv) => (Some(conv), MatchedBy::Contact),
                None => (None, MatchedBy::New),
            },
        };

        debug!(
            inbox_id = raw.inbox_id,
            source_id = %raw.source_id,
            matched_by = ?matched_by,
            conversation = ?conversation.as_ref().map(|c| c.uuid),
            "thread resolved"
        );

        Ok(Resolution {
            contact,
            conversation,
            matched_by,
            dedup_key: raw.source_id.clone(),
        })
    }

    /// Rules 1 and 2; they do not depend on the sender.
    async fn match_thread(
        &self,
        raw: &RawMessage,
        config: &EmailConfig,
    ) -> Result<Option<(Conversation, MatchedBy)>, StoreError> {
        if config.enable_plus_addressing {
            for uuid in raw.recipients().filter_map(|r| plus_address_uuid(&r)) {
                if let Some(conv) = self.store.conversation_by_uuid(uuid).await? {
                    if conv.inbox_id == raw.inbox_id {
                        return Ok(Some((conv, MatchedBy::PlusAddress)));
                    }
                }
            }
        }

        if let Some(parent) = &raw.headers.in_reply_to {
            if let Some(conv) = self
                .store
                .conversation_by_message_id(raw.inbox_id, parent)
                .await?
            {
                return Ok(Some((conv, MatchedBy::InReplyTo)));
            }
        }

        for reference in raw.headers.references.iter().rev() {
            if let Some(conv) = self
                .store
                .conversation_by_message_id(raw.inbox_id, reference)
                .await?
            {
                return Ok(Some((conv, MatchedBy::References)));
            }
        }

        Ok(None)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskmail_core::bus::MessageHeaders;
    use deskmail_core::models::{ChannelKind, ConversationStatus};
    use deskmail_core::store::{Contacts, IngestOutcome, LocalStore, NewInbox, NewIncoming};
    use serde_json::json;

    async fn inbox(store: &LocalStore, name: &str) -> i64 {
        store
            .create_inbox(NewInbox {
                name: name.into(),
                channel: ChannelKind::Email,
                enabled: true,
                from: "help@acme.io".into(),
                config: json!({}),
            })
            .await
            .unwrap()
            .id
    }

    /// Store an inbound message from `sender` as a new conversation.
    async fn seed(store: &LocalStore, inbox_id: i64, sender: &str, message_id: &str) -> Conversation {
        let contact = store.find_or_create_contact(sender, "").await.unwrap();
        match store
            .insert_incoming(NewIncoming {
                inbox_id,
                contact_id: contact.id,
                subject: "Printer".into(),
                source_id: message_id.into(),
                message_id_header: Some(message_id.into()),
                from: sender.into(),
                content: "help".into(),
                ..Default::default()
            })
            .await
            .unwrap()
        {
            IngestOutcome::Inserted { conversation, .. } => conversation,
            IngestOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    fn raw(inbox_id: i64, from: &str, id: &str) -> RawMessage {
        RawMessage::new(
            inbox_id,
            id,
            MessageHeaders {
                message_id: Some(id.into()),
                from: from.into(),
                to: vec!["help@acme.io".into()],
                ..Default::default()
            },
        )
    }

    fn plus_enabled() -> EmailConfig {
        EmailConfig {
            enable_plus_addressing: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_plus_address_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(plus_address_uuid(&format!("help+conv-{id}@acme.io")), Some(id));
        assert_eq!(plus_address_uuid("help+sales@acme.io"), None);
        assert_eq!(plus_address_uuid("help+conv-not-a-uuid@acme.io"), None);
    }

    #[tokio::test]
    async fn test_new_sender_starts_conversation() {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = inbox(&store, "support").await;
        let resolver = ThreadResolver::new(store.clone());

        let res = resolver
            .resolve(&raw(inbox_id, "Alice <alice@example.com>", "<m1@x>"), &plus_enabled())
            .await
            .unwrap();
        assert_eq!(res.matched_by, MatchedBy::New);
        assert!(res.conversation.is_none());
        assert_eq!(res.contact.email, "alice@example.com");
        assert_eq!(res.dedup_key, "<m1@x>");
    }

    #[tokio::test]
    async fn test_plus_address_wins_over_headers() {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = inbox(&store, "support").await;
        let first = seed(&store, inbox_id, "alice@example.com", "<m1@x>").await;
        let second = seed(&store, inbox_id, "bob@example.com", "<m2@x>").await;

        let mut msg = raw(inbox_id, "carol@example.com", "<m3@x>");
        msg.headers.to = vec![format!("Support <help+conv-{}@acme.io>", second.uuid)];
        msg.headers.in_reply_to = Some("<m1@x>".into());

        let resolver = ThreadResolver::new(store.clone());
        let res = resolver.resolve(&msg, &plus_enabled()).await.unwrap();
        assert_eq!(res.matched_by, MatchedBy::PlusAddress);
        assert_eq!(res.conversation.unwrap().id, second.id);

        // disabled: falls through to In-Reply-To
        let res = resolver.resolve(&msg, &EmailConfig::default()).await.unwrap();
        assert_eq!(res.matched_by, MatchedBy::InReplyTo);
        assert_eq!(res.conversation.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_plus_address_from_other_inbox_ignored() {
        let store = Arc::new(LocalStore::in_memory());
        let a = inbox(&store, "support").await;
        let b = inbox(&store, "billing").await;
        let foreign = seed(&store, b, "bob@example.com", "<m1@x>").await;

        let mut msg = raw(a, "carol@example.com", "<m2@x>");
        msg.headers.delivered_to = vec![format!("help+conv-{}@acme.io", foreign.uuid)];

        let res = ThreadResolver::new(store.clone())
            .resolve(&msg, &plus_enabled())
            .await
            .unwrap();
        assert_eq!(res.matched_by, MatchedBy::New);
    }

    #[tokio::test]
    async fn test_references_newest_first() {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = inbox(&store, "support").await;
        let old = seed(&store, inbox_id, "alice@example.com", "<old@x>").await;
        let recent = seed(&store, inbox_id, "bob@example.com", "<recent@x>").await;
        assert_ne!(old.id, recent.id);

        let mut msg = raw(inbox_id, "dave@example.com", "<m9@x>");
        msg.headers.in_reply_to = Some("<unknown@x>".into());
        msg.headers.references = vec!["<old@x>".into(), "<recent@x>".into()];

        let res = ThreadResolver::new(store.clone())
            .resolve(&msg, &EmailConfig::default())
            .await
            .unwrap();
        assert_eq!(res.matched_by, MatchedBy::References);
        assert_eq!(res.conversation.unwrap().id, recent.id);
    }

    #[tokio::test]
    async fn test_contact_fallback_skips_closed() {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = inbox(&store, "support").await;
        let conv = seed(&store, inbox_id, "alice@example.com", "<m1@x>").await;
        let resolver = ThreadResolver::new(store.clone());

        let msg = raw(inbox_id, "ALICE@example.com", "<m2@x>");
        let res = resolver.resolve(&msg, &EmailConfig::default()).await.unwrap();
        assert_eq!(res.matched_by, MatchedBy::Contact);
        assert_eq!(res.conversation.unwrap().id, conv.id);

        store
            .set_conversation_status(conv.id, ConversationStatus::Closed)
            .await
            .unwrap();
        let res = resolver.resolve(&msg, &EmailConfig::default()).await.unwrap();
        assert_eq!(res.matched_by, MatchedBy::New);
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = inbox(&store, "support").await;
        seed(&store, inbox_id, "alice@example.com", "<m1@x>").await;
        let resolver = ThreadResolver::new(store.clone());

        let mut msg = raw(inbox_id, "bob@example.com", "<m2@x>");
        msg.headers.references = vec!["<m1@x>".into()];
        let a = resolver.resolve(&msg, &EmailConfig::default()).await.unwrap();
        let b = resolver.resolve(&msg, &EmailConfig::default()).await.unwrap();
        assert_eq!(a.matched_by, b.matched_by);
        assert_eq!(
            a.conversation.map(|c| c.id),
            b.conversation.map(|c| c.id)
        );
    }
}
