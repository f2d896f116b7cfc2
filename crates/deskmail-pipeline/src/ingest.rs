//! Ingestion pipeline — a fixed worker pool draining the shared queue.
//!
//! Per message: validate → resolve thread → persist atomically → notify
//! event sinks. A duplicate `(inbox_id, source_id)` is a counted no-op.
//! Persistence failures are re-queued with backoff and dropped after
//! `max_attempts`; the next poll after a restart refetches them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use deskmail_core::bus::{IngestQueue, RawMessage};
use deskmail_core::events::EventFanout;
use deskmail_core::models::{ChannelKind, EmailConfig};
use deskmail_core::store::{IngestOutcome, NewIncoming, Store};
use deskmail_core::utils::backoff_delay;

use crate::resolver::ThreadResolver;

const REQUEUE_BASE: Duration = Duration::from_secs(1);
const REQUEUE_MAX: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct IngestStats {
    inserted: AtomicU64,
    conversations_created: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestCounts {
    pub inserted: u64,
    pub conversations_created: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub requeued: u64,
    pub dropped: u64,
}

impl IngestStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestCounts {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestCounts {
            inserted: get(&self.inserted),
            conversations_created: get(&self.conversations_created),
            duplicates: get(&self.duplicates),
            malformed: get(&self.malformed),
            requeued: get(&self.requeued),
            dropped: get(&self.dropped),
        }
    }
}

/// Per-message result, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Processed {
    Inserted { created: bool },
    Duplicate,
    Malformed,
}

// ─────────────────────────────────────────────
// IngestPipeline
// ─────────────────────────────────────────────

pub struct IngestPipeline {
    store: Arc<dyn Store>,
    resolver: ThreadResolver,
    events: EventFanout,
    queue: Arc<IngestQueue>,
    workers: usize,
    max_attempts: u32,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<IngestQueue>,
        events: EventFanout,
        workers: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            resolver: ThreadResolver::new(store.clone()),
            store,
            events,
            queue,
            workers: workers.max(1),
            max_attempts: max_attempts.max(1),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run the worker pool until `cancel` fires. Each worker finishes the
    /// message it holds before exiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.workers, capacity = self.queue.capacity(), "ingestion pipeline started");

        let tracker = TaskTracker::new();
        for worker in 0..self.workers {
            let this = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.worker(worker, cancel).await });
        }
        tracker.close();
        tracker.wait().await;

        let counts = self.stats.snapshot();
        info!(
            inserted = counts.inserted,
            duplicates = counts.duplicates,
            malformed = counts.malformed,
            dropped = counts.dropped,
            left_in_queue = self.queue.depth(),
            "ingestion pipeline stopped"
        );
    }

    async fn worker(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.consume() => match next {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let inbox_id = raw.inbox_id;
            let source_id = raw.source_id.clone();
            match self.process(&raw).await {
                Ok(outcome) => {
                    debug!(worker, inbox_id, source_id = %source_id, ?outcome, "message processed")
                }
                Err(e) => self.requeue(raw, e, &cancel),
            }
        }
        debug!(worker, "ingestion worker exiting");
    }

    /// Validate, resolve, persist and notify one message.
    pub async fn process(&self, raw: &RawMessage) -> anyhow::Result<Processed> {
        if let Err(reason) = raw.validate() {
            warn!(inbox_id = raw.inbox_id, source_id = %raw.source_id, %reason, "skipping malformed message");
            IngestStats::bump(&self.stats.malformed);
            return Ok(Processed::Malformed);
        }

        let inbox = self
            .store
            .get_inbox(raw.inbox_id)
            .await
            .context("loading inbox")?;
        let config = match inbox.channel {
            ChannelKind::Email => inbox.email_config().unwrap_or_else(|e| {
                warn!(inbox_id = inbox.id, error = %e, "undecodable inbox config, threading without it");
                EmailConfig::default()
            }),
            ChannelKind::Unsupported => EmailConfig::default(),
        };

        let resolution = self
            .resolver
            .resolve(raw, &config)
            .await
            .context("resolving thread")?;

        let (content, content_type) = raw.content();
        let subject = match &resolution.conversation {
            Some(_) => raw.headers.subject.clone(),
            None if raw.headers.subject.trim().is_empty() => "(no subject)".to_string(),
            None => raw.headers.subject.clone(),
        };

        let outcome = self
            .store
            .insert_incoming(NewIncoming {
                inbox_id: raw.inbox_id,
                contact_id: resolution.contact.id,
                conversation_id: resolution.conversation.as_ref().map(|c| c.id),
                subject,
                source_id: resolution.dedup_key,
                message_id_header: raw.headers.message_id.clone(),
                in_reply_to: raw.headers.in_reply_to.clone(),
                references: raw.headers.references.clone(),
                from: raw.headers.from.clone(),
                to: raw.headers.to.clone(),
                cc: raw.headers.cc.clone(),
                content,
                content_type,
                text_content: raw.text_body.clone().unwrap_or_default(),
                attachments: raw.attachments.clone(),
                received_at: Some(raw.headers.date.unwrap_or(raw.received_at)),
            })
            .await
            .context("persisting message")?;

        match outcome {
            IngestOutcome::Duplicate => {
                IngestStats::bump(&self.stats.duplicates);
                Ok(Processed::Duplicate)
            }
            IngestOutcome::Inserted {
                conversation,
                message,
                created,
            } => {
                IngestStats::bump(&self.stats.inserted);
                if created {
                    IngestStats::bump(&self.stats.conversations_created);
                    self.events.conversation_created(&conversation).await;
                }
                self.events.message_ingested(&conversation, &message).await;
                Ok(Processed::Inserted { created })
            }
        }
    }

    /// Put a failed message back on the queue after a backoff, or drop it
    /// once the attempt budget is spent.
    fn requeue(&self, mut raw: RawMessage, err: anyhow::Error, cancel: &CancellationToken) {
        raw.attempts += 1;
        if raw.attempts >= self.max_attempts {
            IngestStats::bump(&self.stats.dropped);
            error!(
                inbox_id = raw.inbox_id,
                source_id = %raw.source_id,
                attempts = raw.attempts,
                error = %format!("{err:#}"),
                "dropping message after repeated persistence failures"
            );
            return;
        }

        IngestStats::bump(&self.stats.requeued);
        let delay = backoff_delay(raw.attempts, REQUEUE_BASE, REQUEUE_MAX);
        warn!(
            inbox_id = raw.inbox_id,
            source_id = %raw.source_id,
            attempt = raw.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %format!("{err:#}"),
            "persisting message failed, re-queueing"
        );

        let sender = self.queue.sender();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = sender.send(raw).await;
                }
            }
        });
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deskmail_core::bus::MessageHeaders;
    use deskmail_core::events::EventSink;
    use deskmail_core::models::{Conversation, Message};
    use deskmail_core::store::{Contacts, LocalStore, NewInbox};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        created: AtomicUsize,
        ingested: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn on_conversation_created(&self, _c: &Conversation) -> anyhow::Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_message_ingested(&self, _c: &Conversation, _m: &Message) -> anyhow::Result<()> {
            self.ingested.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup() -> (Arc<LocalStore>, i64, Arc<CountingSink>, IngestPipeline) {
        let store = Arc::new(LocalStore::in_memory());
        let inbox_id = store
            .create_inbox(NewInbox {
                name: "support".into(),
                channel: ChannelKind::Email,
                enabled: true,
                from: "help@acme.io".into(),
                config: json!({ "enable_plus_addressing": true }),
            })
            .await
            .unwrap()
            .id;
        let sink = Arc::new(CountingSink::default());
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(IngestQueue::new(16)),
            EventFanout::new(vec![sink.clone()]),
            2,
            3,
        );
        (store, inbox_id, sink, pipeline)
    }

    fn raw(inbox_id: i64, from: &str, id: &str) -> RawMessage {
        let mut raw = RawMessage::new(
            inbox_id,
            id,
            MessageHeaders {
                message_id: Some(id.into()),
                from: from.into(),
                to: vec!["help@acme.io".into()],
                subject: "Printer on fire".into(),
                ..Default::default()
            },
        );
        raw.text_body = Some("It is very hot.".into());
        raw
    }

    #[tokio::test]
    async fn test_same_message_twice_is_ingested_once() {
        let (store, inbox_id, sink, pipeline) = setup().await;
        let msg = raw(inbox_id, "Alice <alice@example.com>", "<m1@example.com>");

        assert_eq!(
            pipeline.process(&msg).await.unwrap(),
            Processed::Inserted { created: true }
        );
        assert_eq!(pipeline.process(&msg).await.unwrap(), Processed::Duplicate);

        let stats = pipeline.stats();
        assert_eq!(stats.snapshot().inserted, 1);
        assert_eq!(stats.snapshot().duplicates, 1);
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
        assert_eq!(sink.ingested.load(Ordering::SeqCst), 1);

        let contact = store.find_or_create_contact("alice@example.com", "").await.unwrap();
        let conv = store
            .latest_open_conversation(inbox_id, contact.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.conversation_messages(conv.id).await.unwrap().len(), 1);
        assert_eq!(conv.subject, "Printer on fire");
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let (_store, inbox_id, sink, pipeline) = setup().await;
        let msg = raw(inbox_id, "undisclosed-recipients:;", "<m1@example.com>");
        assert_eq!(pipeline.process(&msg).await.unwrap(), Processed::Malformed);
        assert_eq!(pipeline.stats().snapshot().malformed, 1);
        assert_eq!(sink.ingested.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_follow_up_appends_to_conversation() {
        let (store, inbox_id, sink, pipeline) = setup().await;
        pipeline
            .process(&raw(inbox_id, "alice@example.com", "<m1@example.com>"))
            .await
            .unwrap();

        let mut reply = raw(inbox_id, "alice@example.com", "<m2@example.com>");
        reply.headers.in_reply_to = Some("<m1@example.com>".into());
        reply.headers.subject = "Re: Printer on fire".into();
        assert_eq!(
            pipeline.process(&reply).await.unwrap(),
            Processed::Inserted { created: false }
        );
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
        assert_eq!(sink.ingested.load(Ordering::SeqCst), 2);

        let contact = store.find_or_create_contact("alice@example.com", "").await.unwrap();
        let conv = store
            .latest_open_conversation(inbox_id, contact.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.conversation_messages(conv.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_new_mail_from_one_sender_opens_one_conversation() {
        let (store, inbox_id, sink, pipeline) = setup().await;
        let first = raw(inbox_id, "alice@example.com", "<m1@example.com>");
        let mut second = raw(inbox_id, "alice@example.com", "<m2@example.com>");
        second.headers.subject = "Also the scanner".into();

        let (a, b) = tokio::join!(pipeline.process(&first), pipeline.process(&second));
        let mut created = vec![a.unwrap(), b.unwrap()];
        created.sort_by_key(|p| !matches!(p, Processed::Inserted { created: true }));
        assert_eq!(
            created,
            vec![
                Processed::Inserted { created: true },
                Processed::Inserted { created: false }
            ]
        );
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
        assert_eq!(sink.ingested.load(Ordering::SeqCst), 2);

        let contact = store.find_or_create_contact("alice@example.com", "").await.unwrap();
        let conv = store
            .latest_open_conversation(inbox_id, contact.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.conversation_messages(conv.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_inbox_fails_and_is_requeued() {
        let (_store, _inbox_id, _sink, pipeline) = setup().await;
        let msg = raw(999, "alice@example.com", "<m1@example.com>");
        assert!(pipeline.process(&msg).await.is_err());

        let cancel = CancellationToken::new();
        let err = anyhow::anyhow!("store unavailable");
        pipeline.requeue(msg.clone(), err, &cancel);
        assert_eq!(pipeline.stats().snapshot().requeued, 1);

        // the re-queued copy arrives after the backoff with its attempt count
        let again = tokio::time::timeout(Duration::from_secs(5), pipeline.queue.consume())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.source_id, "<m1@example.com>");
    }

    #[tokio::test]
    async fn test_dropped_after_max_attempts() {
        let (_store, _inbox_id, _sink, pipeline) = setup().await;
        let mut msg = raw(999, "alice@example.com", "<m1@example.com>");
        msg.attempts = 2;
        pipeline.requeue(msg, anyhow::anyhow!("still down"), &CancellationToken::new());
        assert_eq!(pipeline.stats().snapshot().dropped, 1);
        assert_eq!(pipeline.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop_on_cancel() {
        let (_store, inbox_id, sink, pipeline) = setup().await;
        let pipeline = Arc::new(pipeline);
        for i in 0..5 {
            pipeline
                .queue
                .publish(raw(inbox_id, &format!("user{i}@example.com"), &format!("<m{i}@x>")))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn(pipeline.clone().run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.stats().snapshot().inserted < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.created.load(Ordering::SeqCst), 5);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
    }
}
