//! Channel trait — the capability every inbox adapter implements.
//!
//! An adapter owns one inbox's connections and credentials:
//! - `receive()` — long-running loop pushing fetched mail into the shared
//!   ingestion queue until cancelled
//! - `send()` — deliver one outgoing message
//! - `close()` — release pooled connections
//!
//! Adapters are built by a [`ChannelInitializer`] keyed on the inbox's
//! channel type, and receive a [`ChannelContext`] from the registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use deskmail_core::bus::{DeliveryReceipt, IngestQueue, OutgoingMessage};
use deskmail_core::crypto::CredentialCipher;
use deskmail_core::models::{ChannelKind, Inbox, OAuthConfig};
use deskmail_core::ChannelError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Writes a refreshed OAuth token back to the stored inbox config.
///
/// Must return only after the token is durably stored.
pub type TokenPersister =
    Arc<dyn Fn(i64, OAuthConfig) -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

/// Records an inbox-level fatal error (shown as `Inbox.last_error`).
pub type ErrorReporter = Arc<dyn Fn(i64, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds an adapter for an inbox.
pub type ChannelInitializer = Arc<
    dyn Fn(&Inbox, ChannelContext) -> Result<Arc<dyn Channel>, ChannelError> + Send + Sync,
>;

/// Collaborators handed to an adapter at construction.
#[derive(Clone)]
pub struct ChannelContext {
    pub cipher: Arc<CredentialCipher>,
    /// Serializes token refresh for one inbox across adapter generations.
    pub refresh_lock: Arc<Mutex<()>>,
    pub persist_token: TokenPersister,
    pub report_error: ErrorReporter,
}

/// Every inbox adapter implements this trait.
#[async_trait]
pub trait Channel: Send + Sync {
    fn inbox_id(&self) -> i64;

    fn kind(&self) -> ChannelKind;

    /// Fetch mail into `queue` until `cancel` fires.
    ///
    /// Returns `Err` only when the whole receive side is unusable.
    async fn receive(
        &self,
        queue: Arc<IngestQueue>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError>;

    /// Deliver one outgoing message.
    async fn send(&self, msg: &OutgoingMessage) -> Result<DeliveryReceipt, ChannelError>;

    /// Attempts after which a failing message is given up, if the adapter
    /// has its own limit.
    fn retry_ceiling(&self) -> Option<u32> {
        None
    }

    /// Release pooled resources. Called after in-flight work has drained.
    async fn close(&self);
}
