//! Dispatch pipeline — pending outgoing messages → channel `send`.
//!
//! Architecture:
//! - Feeder claims due pending messages into a bounded queue, on a poll
//!   interval and whenever the outbox wakes it
//! - Stuck scanner re-claims messages whose claim outlived the threshold
//! - Workers resolve the inbox's live channel from the registry and send
//!
//! The store is the only durable state: claims left behind by a crash are
//! released on the next start. A message can sit in the queue twice (once
//! from the feeder, once from the stuck scanner); only the entry matching
//! the stored attempt count is ever sent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use deskmail_channels::ChannelRegistry;
use deskmail_core::bus::{DispatchQueue, OutgoingMessage};
use deskmail_core::config::MessageConfig;
use deskmail_core::models::Message;
use deskmail_core::store::Store;
use deskmail_core::utils::backoff_delay;
use deskmail_core::ChannelError;

// ─────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub scan_interval: Duration,
    pub stuck_scan_interval: Duration,
    pub stuck_threshold: Duration,
    /// Attempt ceiling when the channel does not impose its own.
    pub max_send_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl DispatchSettings {
    pub fn from_config(cfg: &MessageConfig) -> Self {
        Self {
            workers: cfg.outgoing_queue_workers.max(1),
            queue_size: cfg.outgoing_queue_size.max(1),
            scan_interval: cfg.outgoing_scan_interval(),
            stuck_scan_interval: cfg.stuck_scan_interval(),
            stuck_threshold: cfg.stuck_threshold(),
            max_send_attempts: cfg.max_send_attempts.max(1),
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3600),
        }
    }
}

/// Wakes the feeder so a freshly enqueued reply goes out without waiting
/// for the next poll.
#[derive(Clone, Default)]
pub struct DispatchWaker(Arc<Notify>);

impl DispatchWaker {
    pub fn wake(&self) {
        self.0.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.0.notified().await;
    }
}

/// What happened to one delivery attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    Sent,
    Retry { after: Duration, reason: String },
    Failed { reason: String },
    /// Stale or duplicate queue entry; nothing was sent.
    Skipped,
}

fn ago(d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn after(d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Removes a message id from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

// ─────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────

pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<ChannelRegistry>,
    queue: DispatchQueue,
    waker: DispatchWaker,
    settings: DispatchSettings,
    /// Ids a worker is sending right now.
    in_flight: Mutex<HashSet<i64>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ChannelRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            registry,
            queue: DispatchQueue::new(settings.queue_size),
            waker: DispatchWaker::default(),
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_flight(&self, id: i64) -> Option<InFlight<'_>> {
        // lazily: a guard built for a refused insert would unmark the holder
        self.in_flight().insert(id).then(|| InFlight {
            set: &self.in_flight,
            id,
        })
    }

    pub fn waker(&self) -> DispatchWaker {
        self.waker.clone()
    }

    /// Run feeder, stuck scanner and workers until `cancel` fires. Workers
    /// finish the send they are in before exiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        match self.store.release_claims().await {
            Ok(0) => {}
            Ok(n) => info!(released = n, "released claims left by a previous run"),
            Err(e) => warn!(error = %e, "could not release stale claims"),
        }

        info!(
            workers = self.settings.workers,
            capacity = self.queue.capacity(),
            "dispatch pipeline started"
        );

        let tracker = TaskTracker::new();
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.feed(cancel).await });
        }
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.scan_stuck(cancel).await });
        }
        for worker in 0..self.settings.workers {
            let this = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.worker(worker, cancel).await });
        }
        tracker.close();
        tracker.wait().await;

        info!(left_in_queue = self.queue.depth(), "dispatch pipeline stopped");
    }

    // ─────────────────────────────────────────
    // Feeder
    // ─────────────────────────────────────────

    async fn feed(&self, cancel: CancellationToken) {
        loop {
            let room = self.queue.capacity().saturating_sub(self.queue.depth());
            let mut claimed = 0;
            if room > 0 {
                match self.store.claim_pending(room, Utc::now()).await {
                    Ok(batch) => {
                        claimed = batch.len();
                        if claimed > 0 {
                            debug!(claimed, "claimed pending messages");
                        }
                        if !self.enqueue(batch, &cancel).await {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "claiming pending messages failed"),
                }
            }

            // a full batch means there may be more waiting
            if claimed > 0 && claimed == room {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.waker.woken() => {}
                _ = tokio::time::sleep(self.settings.scan_interval) => {}
            }
        }
    }

    /// Push claimed messages to the workers. False when cancelled; the
    /// messages stay claimed until the next start releases them.
    async fn enqueue(&self, batch: Vec<Message>, cancel: &CancellationToken) -> bool {
        for msg in batch {
            let outgoing = OutgoingMessage::from(&msg);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                res = self.queue.publish(outgoing) => {
                    if res.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    // ─────────────────────────────────────────
    // Stuck scanner
    // ─────────────────────────────────────────

    async fn scan_stuck(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.stuck_scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.rescan_stuck(&cancel).await {
                return;
            }
        }
    }

    /// Re-claim and re-queue messages claimed longer than the threshold.
    async fn rescan_stuck(&self, cancel: &CancellationToken) -> bool {
        match self
            .store
            .reclaim_stuck(ago(self.settings.stuck_threshold), Utc::now())
            .await
        {
            Ok(stuck) => {
                let stuck: Vec<Message> = {
                    let in_flight = self.in_flight();
                    stuck
                        .into_iter()
                        .filter(|m| !in_flight.contains(&m.id))
                        .collect()
                };
                if stuck.is_empty() {
                    return true;
                }
                warn!(count = stuck.len(), "re-dispatching stuck messages");
                self.enqueue(stuck, cancel).await
            }
            Err(e) => {
                warn!(error = %e, "stuck message scan failed");
                true
            }
        }
    }

    // ─────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────

    async fn worker(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.consume() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let id = msg.message_id;
            let delivery = self.deliver(&msg).await;
            debug!(worker, message_id = id, ?delivery, "delivery attempt finished");
        }
        debug!(worker, "dispatch worker exiting");
    }

    /// One delivery attempt, with its outcome recorded in the store.
    ///
    /// The attempt only goes ahead when no other worker holds the message
    /// and the store still expects exactly this attempt.
    pub async fn deliver(&self, msg: &OutgoingMessage) -> Delivery {
        let Some(_flight) = self.start_flight(msg.message_id) else {
            debug!(message_id = msg.message_id, "message already in flight, dropping duplicate");
            return Delivery::Skipped;
        };
        match self
            .store
            .begin_delivery(msg.message_id, msg.attempt, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = msg.message_id, attempt = msg.attempt, "stale queue entry, skipping");
                return Delivery::Skipped;
            }
            Err(e) => {
                // the claim stays; the stuck scanner picks the message up again
                warn!(message_id = msg.message_id, error = %e, "could not start delivery");
                return Delivery::Skipped;
            }
        }

        let handle = self.registry.channel(msg.inbox_id).await;
        let (result, ceiling) = match &handle {
            Some(channel) => (
                channel.send(msg).await,
                channel
                    .retry_ceiling()
                    .unwrap_or(self.settings.max_send_attempts),
            ),
            None => (
                Err(ChannelError::Network(format!(
                    "inbox {} has no running channel",
                    msg.inbox_id
                ))),
                self.settings.max_send_attempts,
            ),
        };
        drop(handle);

        let delivery = match result {
            Ok(receipt) => {
                info!(
                    message_id = msg.message_id,
                    conversation_id = msg.conversation_id,
                    header = %receipt.message_id_header,
                    accepted = receipt.accepted.len(),
                    "message sent"
                );
                Delivery::Sent
            }
            Err(e) if e.is_permanent() || msg.attempt >= ceiling => {
                warn!(
                    message_id = msg.message_id,
                    attempt = msg.attempt,
                    ceiling,
                    kind = e.kind(),
                    error = %e,
                    "giving up on message"
                );
                Delivery::Failed {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                let after = backoff_delay(msg.attempt, self.settings.retry_base, self.settings.retry_max);
                warn!(
                    message_id = msg.message_id,
                    attempt = msg.attempt,
                    retry_in_secs = after.as_secs(),
                    kind = e.kind(),
                    error = %e,
                    "send failed, will retry"
                );
                Delivery::Retry {
                    after,
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = self.record(msg.message_id, &delivery).await {
            // the claim stays; the stuck scanner picks the message up again
            error!(message_id = msg.message_id, error = %e, "could not record delivery outcome");
        }
        delivery
    }

    async fn record(&self, id: i64, delivery: &Delivery) -> Result<(), deskmail_core::StoreError> {
        match delivery {
            Delivery::Sent => self.store.mark_sent(id, Utc::now()).await,
            Delivery::Retry { after: delay, reason } => {
                self.store.mark_retry(id, reason, after(*delay)).await
            }
            Delivery::Failed { reason } => self.store.mark_failed(id, reason).await,
            Delivery::Skipped => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deskmail_channels::base::{ChannelContext, ChannelInitializer};
    use deskmail_channels::Channel;
    use deskmail_core::bus::{DeliveryReceipt, IngestQueue};
    use deskmail_core::crypto::CredentialCipher;
    use deskmail_core::models::{ChannelKind, Conversation, Inbox, MessageStatus};
    use deskmail_core::store::{Contacts, IngestOutcome, LocalStore, NewInbox, NewIncoming, NewOutgoing};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted channel: pops one result per send (default success) and
    /// records the ids it was asked to send.
    #[derive(Clone, Default)]
    struct Script {
        results: Arc<Mutex<VecDeque<Result<(), ChannelError>>>>,
        sent: Arc<Mutex<Vec<i64>>>,
        ceiling: Option<u32>,
    }

    struct ScriptedChannel {
        inbox_id: i64,
        script: Script,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn inbox_id(&self) -> i64 {
            self.inbox_id
        }

        fn kind(&self) -> ChannelKind {
            ChannelKind::Email
        }

        async fn receive(
            &self,
            _queue: Arc<IngestQueue>,
            cancel: CancellationToken,
        ) -> Result<(), ChannelError> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn send(&self, msg: &OutgoingMessage) -> Result<DeliveryReceipt, ChannelError> {
            self.script.sent.lock().unwrap().push(msg.message_id);
            let next = self.script.results.lock().unwrap().pop_front();
            next.unwrap_or(Ok(())).map(|()| DeliveryReceipt {
                message_id_header: msg.message_id_header.clone().unwrap_or_default(),
                accepted: msg.to.clone(),
            })
        }

        fn retry_ceiling(&self) -> Option<u32> {
            self.script.ceiling
        }

        async fn close(&self) {}
    }

    impl Script {
        fn push(&self, result: Result<(), ChannelError>) {
            self.results.lock().unwrap().push_back(result);
        }

        fn sent(&self) -> Vec<i64> {
            self.sent.lock().unwrap().clone()
        }

        fn initializer(&self) -> ChannelInitializer {
            let script = self.clone();
            Arc::new(move |inbox: &Inbox, _ctx: ChannelContext| {
                let ch: Arc<dyn Channel> = Arc::new(ScriptedChannel {
                    inbox_id: inbox.id,
                    script: script.clone(),
                });
                Ok(ch)
            })
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            workers: 2,
            queue_size: 16,
            scan_interval: Duration::from_millis(50),
            stuck_scan_interval: Duration::from_millis(50),
            stuck_threshold: Duration::from_secs(600),
            max_send_attempts: 3,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(600),
        }
    }

    struct Fixture {
        store: Arc<LocalStore>,
        registry: Arc<ChannelRegistry>,
        conversation: Conversation,
        dispatcher: Arc<Dispatcher>,
    }

    async fn fixture(script: &Script, start_channels: bool) -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let inbox = store
            .create_inbox(NewInbox {
                name: "support".into(),
                channel: ChannelKind::Email,
                enabled: true,
                from: "help@acme.io".into(),
                config: json!({}),
            })
            .await
            .unwrap();
        let contact = store
            .find_or_create_contact("alice@example.com", "Alice")
            .await
            .unwrap();
        let IngestOutcome::Inserted { conversation, .. } = store
            .insert_incoming(NewIncoming {
                inbox_id: inbox.id,
                contact_id: contact.id,
                subject: "Printer".into(),
                source_id: "<m1@example.com>".into(),
                message_id_header: Some("<m1@example.com>".into()),
                from: "alice@example.com".into(),
                content: "help".into(),
                ..Default::default()
            })
            .await
            .unwrap()
        else {
            panic!("unexpected duplicate");
        };

        let registry = Arc::new(ChannelRegistry::new(
            store.clone(),
            Arc::new(CredentialCipher::new("dispatch-test").unwrap()),
            Arc::new(IngestQueue::new(4)),
            Duration::from_secs(1),
        ));
        if start_channels {
            registry.start(&script.initializer()).await.unwrap();
        }

        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry.clone(), settings()));
        Fixture {
            store,
            registry,
            conversation,
            dispatcher,
        }
    }

    async fn reply(store: &LocalStore, conversation_id: i64, body: &str) -> Message {
        store
            .create_outgoing(NewOutgoing {
                conversation_id,
                sender_id: 1,
                from: "help@acme.io".into(),
                to: vec!["alice@example.com".into()],
                subject: "Re: Printer".into(),
                content: body.into(),
                message_id_header: format!("<{body}@acme.io>"),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Claim everything due at `now` and deliver it.
    async fn deliver_due(f: &Fixture, now: DateTime<Utc>) -> Vec<Delivery> {
        let mut out = Vec::new();
        for m in f.store.claim_pending(16, now).await.unwrap() {
            out.push(f.dispatcher.deliver(&OutgoingMessage::from(&m)).await);
        }
        out
    }

    #[tokio::test]
    async fn test_success_marks_sent() {
        let script = Script::default();
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        assert_eq!(deliver_due(&f, Utc::now()).await, vec![Delivery::Sent]);
        let stored = f.store.get_message(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(stored.attempts, 1);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let script = Script::default();
        script.push(Err(ChannelError::Network("connection reset".into())));
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        let out = deliver_due(&f, Utc::now()).await;
        assert!(matches!(out[0], Delivery::Retry { after, .. } if after == Duration::from_secs(30)));

        let stored = f.store.get_message(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.claimed_at.is_none());
        assert!(stored.next_attempt_at.unwrap() > Utc::now());
        assert!(stored.last_error.unwrap().contains("connection reset"));

        // not due yet
        assert!(deliver_due(&f, Utc::now()).await.is_empty());
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_fails_after_exactly_ceiling_attempts() {
        let script = Script {
            ceiling: Some(2),
            ..Default::default()
        };
        for _ in 0..3 {
            script.push(Err(ChannelError::Network("timeout".into())));
        }
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;
        let later = Utc::now() + TimeDelta::hours(2);

        assert!(matches!(deliver_due(&f, later).await[0], Delivery::Retry { .. }));
        assert!(matches!(deliver_due(&f, later).await[0], Delivery::Failed { .. }));
        assert!(deliver_due(&f, later).await.is_empty());

        let stored = f.store.get_message(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(script.sent().len(), 2);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let script = Script::default();
        script.push(Err(ChannelError::RejectedRecipient("550 no such user".into())));
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        assert!(matches!(deliver_due(&f, Utc::now()).await[0], Delivery::Failed { .. }));
        let stored = f.store.get_message(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, 1);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_missing_channel_is_retried() {
        let script = Script::default();
        let f = fixture(&script, false).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        let out = deliver_due(&f, Utc::now()).await;
        assert!(matches!(&out[0], Delivery::Retry { reason, .. } if reason.contains("no running channel")));
        assert_eq!(f.store.get_message(m.id).await.unwrap().status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_stuck_messages_are_requeued() {
        let script = Script::default();
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        // a claim from a worker that died an hour ago
        let claimed = f
            .store
            .claim_pending(1, Utc::now() - TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(f.dispatcher.rescan_stuck(&CancellationToken::new()).await);
        assert_eq!(f.dispatcher.queue.depth(), 1);
        let queued = f.dispatcher.queue.consume().await.unwrap();
        assert_eq!(queued.message_id, m.id);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_stuck_rescan_does_not_double_send() {
        let script = Script::default();
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;
        let cancel = CancellationToken::new();

        // claimed by the feeder, then left waiting in the queue past the threshold
        let batch = f
            .store
            .claim_pending(16, Utc::now() - TimeDelta::minutes(20))
            .await
            .unwrap();
        assert!(f.dispatcher.enqueue(batch, &cancel).await);
        assert!(f.dispatcher.rescan_stuck(&cancel).await);
        assert_eq!(f.dispatcher.queue.depth(), 2);

        let first = f.dispatcher.queue.consume().await.unwrap();
        let second = f.dispatcher.queue.consume().await.unwrap();
        let (a, b) = tokio::join!(f.dispatcher.deliver(&first), f.dispatcher.deliver(&second));
        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|d| matches!(d, Delivery::Skipped));
        assert_eq!(outcomes, vec![Delivery::Sent, Delivery::Skipped]);

        assert_eq!(script.sent(), vec![m.id]);
        let stored = f.store.get_message(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.attempts, 1);

        // a leftover entry delivered later is dropped as well
        assert_eq!(f.dispatcher.deliver(&first).await, Delivery::Skipped);
        assert_eq!(script.sent().len(), 1);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_entry_from_before_a_retry_is_skipped() {
        let script = Script::default();
        script.push(Err(ChannelError::Network("timeout".into())));
        let f = fixture(&script, true).await;
        let m = reply(&f.store, f.conversation.id, "r1").await;

        let claimed = f.store.claim_pending(1, Utc::now()).await.unwrap();
        let stale = OutgoingMessage::from(&claimed[0]);
        assert!(matches!(f.dispatcher.deliver(&stale).await, Delivery::Retry { .. }));

        // re-claimed for attempt 2; the attempt-1 entry must not go out again
        let later = Utc::now() + TimeDelta::hours(1);
        let fresh = f.store.claim_pending(1, later).await.unwrap();
        assert_eq!(f.dispatcher.deliver(&stale).await, Delivery::Skipped);
        assert_eq!(f.dispatcher.deliver(&OutgoingMessage::from(&fresh[0])).await, Delivery::Sent);
        assert_eq!(script.sent(), vec![m.id, m.id]);
        assert_eq!(f.store.get_message(m.id).await.unwrap().attempts, 2);
        f.registry.close().await;
    }

    #[tokio::test]
    async fn test_run_delivers_in_conversation_order() {
        let script = Script::default();
        let f = fixture(&script, true).await;
        let first = reply(&f.store, f.conversation.id, "r1").await;
        let second = reply(&f.store, f.conversation.id, "r2").await;

        // leftover claim from a previous process
        f.store.claim_pending(1, Utc::now()).await.unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.dispatcher.clone().run(cancel.clone()));
        f.dispatcher.waker().wake();

        tokio::time::timeout(Duration::from_secs(5), async {
            while script.sent().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(script.sent(), vec![first.id, second.id]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        for id in [first.id, second.id] {
            assert_eq!(f.store.get_message(id).await.unwrap().status, MessageStatus::Sent);
        }
        f.registry.close().await;
    }
}
