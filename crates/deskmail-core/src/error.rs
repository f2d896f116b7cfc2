//! Error taxonomy shared across channels, pipelines, and the store.
//!
//! Channel errors are classified so callers can decide between retrying,
//! refreshing credentials, or failing a message permanently without
//! string-matching on messages.

use thiserror::Error;

use crate::crypto::CipherError;

// ─────────────────────────────────────────────
// ChannelError
// ─────────────────────────────────────────────

/// Failure raised by a channel adapter or one of its protocol clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The inbox configuration is unusable (missing host, bad TLS type, ...).
    #[error("invalid channel config: {0}")]
    Config(String),

    /// The server rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Connect/read/write failure or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered something we did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every recipient of an outgoing message was refused.
    #[error("recipient rejected: {0}")]
    RejectedRecipient(String),

    /// Mailbox or sending quota exhausted.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// A refreshed OAuth token could not be written back to the store.
    #[error("failed to persist refreshed token: {0}")]
    TokenPersist(String),
}

impl ChannelError {
    /// Authentication failures trigger a forced token refresh on OAuth inboxes.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChannelError::Auth(_))
    }

    /// Errors that retrying the same message can never fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ChannelError::Config(_) | ChannelError::RejectedRecipient(_)
        )
    }

    /// Short machine-friendly kind, used in logs and stored failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::Config(_) => "config",
            ChannelError::Auth(_) => "auth",
            ChannelError::Network(_) => "network",
            ChannelError::Protocol(_) => "protocol",
            ChannelError::RejectedRecipient(_) => "rejected_recipient",
            ChannelError::Quota(_) => "quota",
            ChannelError::TokenPersist(_) => "token_persist",
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Network(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ChannelError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ChannelError::Network("operation timed out".to_string())
    }
}

// ─────────────────────────────────────────────
// StoreError
// ─────────────────────────────────────────────

/// Failure raised by a [`crate::store::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// ConfigError
// ─────────────────────────────────────────────

/// Problems found by [`crate::config::Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("app.encryptionKey is not set")]
    MissingEncryptionKey,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field}: invalid duration '{value}'")]
    Duration { field: &'static str, value: String },
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(ChannelError::RejectedRecipient("550".into()).is_permanent());
        assert!(ChannelError::Config("no smtp".into()).is_permanent());
        assert!(!ChannelError::Network("reset".into()).is_permanent());
        assert!(!ChannelError::Quota("452".into()).is_permanent());
        assert!(!ChannelError::Auth("535".into()).is_permanent());
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ChannelError = io.into();
        assert_eq!(err.kind(), "network");
    }

    #[test]
    fn test_store_not_found_display() {
        let err = StoreError::not_found("inbox", 7);
        assert_eq!(err.to_string(), "inbox 7 not found");
    }
}
