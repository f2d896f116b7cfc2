//! Domain records persisted by the store.

pub mod conversation;
pub mod inbox;

pub use conversation::{
    Agent, Attachment, Contact, ContentType, Conversation, ConversationStatus, Message,
    MessageStatus, MessageType, SenderType,
};
pub use inbox::{
    AuthProtocol, AuthType, ChannelKind, EmailConfig, ImapConfig, Inbox, OAuthConfig,
    OAuthProvider, SmtpConfig, TlsType, redact_inbox, REDACTED,
};
