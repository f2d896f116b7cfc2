//! Deskmail Channels — inbox adapters and their lifecycle.
//!
//! This crate provides:
//! - **base**: The `Channel` trait every inbox adapter implements
//! - **registry**: `ChannelRegistry` — one live adapter per enabled inbox,
//!   config reloads, and bounded draining
//! - **email**: IMAP polling, pooled SMTP delivery, OAuth token handling
//! - **diagnostics**: one-shot IMAP/SMTP connection tests

pub mod base;
pub mod registry;

#[cfg(feature = "email")]
pub mod transport;

#[cfg(feature = "email")]
pub mod email;

#[cfg(feature = "email")]
pub mod diagnostics;

pub use base::Channel;
pub use registry::ChannelRegistry;
