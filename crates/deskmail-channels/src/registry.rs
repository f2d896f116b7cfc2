//! Channel Registry — one live adapter per enabled inbox.
//!
//! Responsibilities:
//! - Build an adapter for every enabled inbox and spawn its receive loop
//! - Hand out send handles to the dispatch pipeline
//! - Reload: restart only inboxes whose configuration changed
//! - Drain replaced adapters in the background without touching the
//!   shared ingestion queue
//!
//! Each adapter gets a [`ChannelContext`] whose token persister writes
//! refreshed OAuth tokens back into the stored (sealed) inbox config, and
//! whose error reporter records inbox-level failures as `last_error`.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use deskmail_core::bus::IngestQueue;
use deskmail_core::crypto::CredentialCipher;
use deskmail_core::models::{ChannelKind, Inbox, OAuthConfig};
use deskmail_core::store::Store;
use deskmail_core::{ChannelError, StoreError};

use crate::base::{
    BoxFuture, Channel, ChannelContext, ChannelInitializer, ErrorReporter, TokenPersister,
};

// ─────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────

/// A live send capability. While any handle exists, draining the adapter
/// waits for it (bounded by the shutdown timeout).
pub struct ChannelHandle {
    channel: Arc<dyn Channel>,
    _inflight: TaskTrackerToken,
}

impl Deref for ChannelHandle {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

struct Entry {
    channel: Arc<dyn Channel>,
    fingerprint: String,
    cancel: CancellationToken,
    inflight: TaskTracker,
    receiver: JoinHandle<()>,
}

/// What a [`ChannelRegistry::reload`] changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: usize,
    pub restarted: usize,
    pub stopped: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Identity of an inbox's adapter configuration. OAuth token rotation is
/// not part of it.
fn fingerprint(inbox: &Inbox) -> String {
    let config = match inbox.channel {
        ChannelKind::Email => inbox
            .email_config()
            .map(|c| c.fingerprint())
            .unwrap_or_else(|_| inbox.config.to_string()),
        ChannelKind::Unsupported => inbox.config.to_string(),
    };
    format!("{}|{}|{}", inbox.channel, inbox.from, config)
}

// ─────────────────────────────────────────────
// ChannelRegistry
// ─────────────────────────────────────────────

pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    cipher: Arc<CredentialCipher>,
    queue: Arc<IngestQueue>,
    shutdown_timeout: Duration,
    entries: RwLock<HashMap<i64, Entry>>,
    /// Per-inbox refresh locks, kept across adapter generations.
    refresh_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    draining: TaskTracker,
    root: CancellationToken,
}

impl ChannelRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<CredentialCipher>,
        queue: Arc<IngestQueue>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            queue,
            shutdown_timeout,
            entries: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            draining: TaskTracker::new(),
            root: CancellationToken::new(),
        }
    }

    /// Start an adapter for every enabled inbox. Inboxes whose adapter
    /// fails to initialize are skipped. Returns the number running.
    pub async fn start(&self, init: &ChannelInitializer) -> Result<usize, StoreError> {
        let inboxes = self.store.list_inboxes().await?;
        let mut entries = self.entries.write().await;

        for inbox in inboxes.iter().filter(|i| i.is_active()) {
            if entries.contains_key(&inbox.id) {
                continue;
            }
            if let Some(entry) = self.launch(inbox, init).await {
                entries.insert(inbox.id, entry);
            }
        }

        info!(running = entries.len(), "channel registry started");
        Ok(entries.len())
    }

    /// Re-read inboxes and converge the running set onto them.
    pub async fn reload(&self, init: &ChannelInitializer) -> Result<ReloadSummary, StoreError> {
        let inboxes = self.store.list_inboxes().await?;
        let active: HashMap<i64, &Inbox> = inboxes
            .iter()
            .filter(|i| i.is_active())
            .map(|i| (i.id, i))
            .collect();

        let mut summary = ReloadSummary::default();
        let mut entries = self.entries.write().await;

        let gone: Vec<i64> = entries
            .keys()
            .filter(|id| !active.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(entry) = entries.remove(&id) {
                info!(inbox_id = id, "inbox disabled or removed, stopping adapter");
                self.drain_in_background(id, entry);
                summary.stopped += 1;
            }
        }

        for (id, inbox) in active {
            let replacing = match entries.get(&id) {
                Some(entry) if entry.fingerprint == fingerprint(inbox) => {
                    summary.unchanged += 1;
                    continue;
                }
                Some(_) => true,
                None => false,
            };

            if let Some(old) = entries.remove(&id) {
                info!(inbox_id = id, "inbox config changed, replacing adapter");
                self.drain_in_background(id, old);
            }
            match self.launch(inbox, init).await {
                Some(entry) => {
                    entries.insert(id, entry);
                    if replacing {
                        summary.restarted += 1;
                    } else {
                        summary.started += 1;
                    }
                }
                None => summary.failed += 1,
            }
        }

        info!(?summary, "channel registry reloaded");
        Ok(summary)
    }

    /// Stop every adapter and wait for all drains, including ones started
    /// by earlier reloads.
    pub async fn close(&self) {
        info!("closing channel registry");
        self.root.cancel();

        let entries: Vec<(i64, Entry)> = self.entries.write().await.drain().collect();
        for (id, entry) in entries {
            self.drain_in_background(id, entry);
        }

        self.draining.close();
        self.draining.wait().await;
        info!("channel registry closed");
    }

    /// Send handle for an inbox, if its adapter is running.
    pub async fn channel(&self, inbox_id: i64) -> Option<ChannelHandle> {
        let entries = self.entries.read().await;
        let entry = entries.get(&inbox_id)?;
        Some(ChannelHandle {
            channel: entry.channel.clone(),
            _inflight: entry.inflight.token(),
        })
    }

    /// Ids of inboxes with a running adapter, sorted.
    pub async fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ─────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────

    async fn launch(&self, inbox: &Inbox, init: &ChannelInitializer) -> Option<Entry> {
        let ctx = self.context(inbox.id).await;
        let channel = match init(inbox, ctx) {
            Ok(channel) => channel,
            Err(e) => {
                error!(inbox_id = inbox.id, inbox = %inbox.name, error = %e, "inbox adapter failed to start");
                if let Err(se) = self.store.set_inbox_error(inbox.id, Some(e.to_string())).await {
                    warn!(inbox_id = inbox.id, error = %se, "could not record inbox error");
                }
                return None;
            }
        };

        if inbox.last_error.is_some() {
            if let Err(e) = self.store.set_inbox_error(inbox.id, None).await {
                warn!(inbox_id = inbox.id, error = %e, "could not clear inbox error");
            }
        }

        let cancel = self.root.child_token();
        let receiver = {
            let channel = channel.clone();
            let queue = self.queue.clone();
            let cancel = cancel.clone();
            let inbox_id = inbox.id;
            tokio::spawn(async move {
                if let Err(e) = channel.receive(queue, cancel).await {
                    error!(inbox_id, error = %e, "receive loop failed");
                }
                debug!(inbox_id, "receive loop exited");
            })
        };

        info!(inbox_id = inbox.id, inbox = %inbox.name, kind = %channel.kind(), "inbox adapter started");
        Some(Entry {
            channel,
            fingerprint: fingerprint(inbox),
            cancel,
            inflight: TaskTracker::new(),
            receiver,
        })
    }

    async fn context(&self, inbox_id: i64) -> ChannelContext {
        let refresh_lock = self
            .refresh_locks
            .lock()
            .await
            .entry(inbox_id)
            .or_default()
            .clone();
        ChannelContext {
            cipher: self.cipher.clone(),
            refresh_lock,
            persist_token: token_persister(self.store.clone(), self.cipher.clone()),
            report_error: error_reporter(self.store.clone()),
        }
    }

    fn drain_in_background(&self, inbox_id: i64, entry: Entry) {
        self.draining
            .spawn(drain(inbox_id, entry, self.shutdown_timeout));
    }
}

/// Cancel, wait for in-flight sends and the receive loop, then close.
async fn drain(inbox_id: i64, entry: Entry, timeout: Duration) {
    entry.cancel.cancel();
    entry.inflight.close();

    let mut receiver = entry.receiver;
    let finished = tokio::time::timeout(timeout, async {
        entry.inflight.wait().await;
        let _ = (&mut receiver).await;
    })
    .await
    .is_ok();

    if !finished {
        warn!(
            inbox_id,
            timeout_secs = timeout.as_secs(),
            "in-flight work did not finish in time, aborting"
        );
        receiver.abort();
    }

    entry.channel.close().await;
    info!(inbox_id, "inbox adapter stopped");
}

// ─────────────────────────────────────────────
// Context callbacks
// ─────────────────────────────────────────────

fn token_persister(store: Arc<dyn Store>, cipher: Arc<CredentialCipher>) -> TokenPersister {
    Arc::new(
        move |inbox_id: i64, fresh: OAuthConfig| -> BoxFuture<'static, Result<(), ChannelError>> {
            let store = store.clone();
            let cipher = cipher.clone();
            Box::pin(async move {
                persist_token(store.as_ref(), &cipher, inbox_id, fresh)
                    .await
                    .map_err(|e| ChannelError::TokenPersist(format!("{e:#}")))
            })
        },
    )
}

/// Seal the new token set into the stored config. Only the token fields are
/// written so a config edit that lands while a refresh is in flight survives.
async fn persist_token(
    store: &dyn Store,
    cipher: &CredentialCipher,
    inbox_id: i64,
    fresh: OAuthConfig,
) -> anyhow::Result<()> {
    store
        .update_inbox_tokens(
            inbox_id,
            cipher.seal(&fresh.access_token)?,
            cipher.seal(&fresh.refresh_token)?,
            fresh.expires_at,
        )
        .await
        .with_context(|| format!("writing tokens for inbox {inbox_id}"))?;
    debug!(inbox_id, "persisted refreshed OAuth token");
    Ok(())
}

fn error_reporter(store: Arc<dyn Store>) -> ErrorReporter {
    Arc::new(move |inbox_id: i64, reason: String| -> BoxFuture<'static, ()> {
        let store = store.clone();
        Box::pin(async move {
            if let Err(e) = store.set_inbox_error(inbox_id, Some(reason)).await {
                warn!(inbox_id, error = %e, "could not record inbox error");
            }
        })
    })
}

// ─────────────────────────────────────────────
// Initializer
// ─────────────────────────────────────────────

/// Initializer selecting the adapter by `Inbox.channel`.
pub fn default_initializer() -> ChannelInitializer {
    Arc::new(init_channel)
}

#[cfg_attr(not(feature = "email"), allow(unused_variables))]
fn init_channel(inbox: &Inbox, ctx: ChannelContext) -> Result<Arc<dyn Channel>, ChannelError> {
    match inbox.channel {
        #[cfg(feature = "email")]
        ChannelKind::Email => Ok(Arc::new(crate::email::EmailChannel::from_inbox(inbox, ctx)?)),
        other => Err(ChannelError::Config(format!(
            "channel type '{other}' is not supported"
        ))),
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
