//! Inbox records and the email channel configuration they carry.
//!
//! `Inbox.config` is stored as opaque JSON with secrets sealed by
//! [`crate::crypto::CredentialCipher`]; [`EmailConfig`] is its decoded form.
//! Keys on disk are snake_case, matching what the admin API writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::utils::duration_or;

/// Mask shown in place of secrets when configs are listed.
pub const REDACTED: &str = "••••••••";

// ─────────────────────────────────────────────
// Inbox
// ─────────────────────────────────────────────

/// Channel type of an inbox. Only email is implemented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Email,
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// A configured inbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Inbox {
    pub id: i64,
    pub name: String,
    pub channel: ChannelKind,
    pub enabled: bool,
    /// Default From address for outgoing mail.
    pub from: String,
    /// Channel-specific configuration (sealed secrets).
    pub config: serde_json::Value,
    /// Inbox-level fatal error surfaced to administrators.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inbox {
    /// Whether the registry should run an adapter for this inbox.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    /// Decode the stored config. Secrets are returned as stored (sealed).
    pub fn email_config(&self) -> Result<EmailConfig, ChannelError> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| ChannelError::Config(format!("inbox {}: {}", self.id, e)))
    }
}

/// Copy of `inbox` with every secret in its email config masked.
/// Configs that do not decode are returned untouched.
pub fn redact_inbox(inbox: &Inbox) -> Inbox {
    let mut out = inbox.clone();
    if inbox.channel == ChannelKind::Email {
        if let Ok(mut cfg) = inbox.email_config() {
            cfg.redact();
            if let Ok(value) = serde_json::to_value(&cfg) {
                out.config = value;
            }
        }
    }
    out
}

// ─────────────────────────────────────────────
// EmailConfig
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    #[serde(alias = "")]
    Password,
    #[serde(rename = "oauth2")]
    OAuth2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsType {
    None,
    Starttls,
    #[default]
    Tls,
}

impl std::fmt::Display for TlsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TlsType::None => "none",
            TlsType::Starttls => "starttls",
            TlsType::Tls => "tls",
        })
    }
}

/// SMTP authentication mechanism for password inboxes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    #[default]
    #[serde(alias = "")]
    None,
    Plain,
    Login,
    Cram,
}

impl std::fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AuthProtocol::None => "none",
            AuthProtocol::Plain => "plain",
            AuthProtocol::Login => "login",
            AuthProtocol::Cram => "cram",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Microsoft,
}

/// OAuth2 client registration plus the current token set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub provider: OAuthProvider,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Microsoft tenant; empty means `common`.
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// One SMTP account/pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub auth_protocol: AuthProtocol,
    pub tls_type: TlsType,
    pub tls_skip_verify: bool,
    pub hello_hostname: String,
    pub max_conns: usize,
    pub max_msg_retries: u32,
    pub idle_timeout: String,
    pub pool_wait_timeout: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            auth_protocol: AuthProtocol::Login,
            tls_type: TlsType::Starttls,
            tls_skip_verify: false,
            hello_hostname: String::new(),
            max_conns: 10,
            max_msg_retries: 2,
            idle_timeout: "25s".to_string(),
            pool_wait_timeout: "60s".to_string(),
        }
    }
}

impl SmtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        duration_or(&self.idle_timeout, Duration::from_secs(25))
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        duration_or(&self.pool_wait_timeout, Duration::from_secs(60))
    }

    /// EHLO argument; servers reject an empty one.
    pub fn hello_name(&self) -> &str {
        if self.hello_hostname.is_empty() {
            "localhost"
        } else {
            &self.hello_hostname
        }
    }
}

/// One IMAP mailbox to poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub tls_type: TlsType,
    pub tls_skip_verify: bool,
    pub read_interval: String,
    pub scan_inbox_since: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            username: String::new(),
            password: String::new(),
            mailbox: "INBOX".to_string(),
            tls_type: TlsType::Tls,
            tls_skip_verify: false,
            read_interval: "5m".to_string(),
            scan_inbox_since: "48h".to_string(),
        }
    }
}

/// Minimum poll interval, regardless of configuration.
pub const MIN_READ_INTERVAL: Duration = Duration::from_secs(5);

impl ImapConfig {
    pub fn read_interval(&self) -> Duration {
        duration_or(&self.read_interval, Duration::from_secs(300)).max(MIN_READ_INTERVAL)
    }

    pub fn scan_inbox_since(&self) -> Duration {
        duration_or(&self.scan_inbox_since, Duration::from_secs(48 * 3600))
    }
}

/// Decoded `Inbox.config` for email inboxes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub auth_type: AuthType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    pub smtp: Vec<SmtpConfig>,
    pub imap: Vec<ImapConfig>,
    /// Overrides `Inbox.from` when set.
    pub from: String,
    pub enable_plus_addressing: bool,
    pub auto_assign_on_reply: bool,
    /// Template rendered into outgoing replies.
    pub signature: String,
}

impl EmailConfig {
    pub fn is_oauth(&self) -> bool {
        self.auth_type == AuthType::OAuth2
    }

    /// Strip surrounding whitespace from non-secret fields.
    pub fn trim(&mut self) {
        self.from = self.from.trim().to_string();
        for s in &mut self.smtp {
            s.host = s.host.trim().to_string();
            s.username = s.username.trim().to_string();
            s.hello_hostname = s.hello_hostname.trim().to_string();
        }
        for i in &mut self.imap {
            i.host = i.host.trim().to_string();
            i.username = i.username.trim().to_string();
            i.mailbox = i.mailbox.trim().to_string();
        }
        if let Some(o) = self.oauth.as_mut() {
            o.client_id = o.client_id.trim().to_string();
            o.tenant_id = o.tenant_id.trim().to_string();
        }
    }

    /// Check structural invariants. Does not touch the network.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.is_oauth() {
            let oauth = self
                .oauth
                .as_ref()
                .ok_or_else(|| ChannelError::Config("oauth2 auth requires an oauth block".into()))?;
            if oauth.client_id.is_empty() {
                return Err(ChannelError::Config("oauth.client_id is required".into()));
            }
        }

        for (i, s) in self.smtp.iter().enumerate() {
            if s.host.is_empty() {
                return Err(ChannelError::Config(format!("smtp[{i}].host is required")));
            }
            if s.port == 0 {
                return Err(ChannelError::Config(format!("smtp[{i}].port must be > 0")));
            }
            if s.max_conns == 0 {
                return Err(ChannelError::Config(format!("smtp[{i}].max_conns must be > 0")));
            }
        }

        for (i, m) in self.imap.iter().enumerate() {
            if m.host.is_empty() {
                return Err(ChannelError::Config(format!("imap[{i}].host is required")));
            }
            if m.port == 0 {
                return Err(ChannelError::Config(format!("imap[{i}].port must be > 0")));
            }
            if m.mailbox.is_empty() {
                return Err(ChannelError::Config(format!("imap[{i}].mailbox is required")));
            }
        }

        Ok(())
    }

    /// Mask every secret, for admin listings.
    pub fn redact(&mut self) {
        fn mask(s: &mut String) {
            if !s.is_empty() {
                *s = REDACTED.to_string();
            }
        }
        for s in &mut self.smtp {
            mask(&mut s.password);
        }
        for i in &mut self.imap {
            mask(&mut i.password);
        }
        if let Some(o) = self.oauth.as_mut() {
            mask(&mut o.access_token);
            mask(&mut o.refresh_token);
            mask(&mut o.client_secret);
        }
    }

    /// Stable identity of the config for reload change detection.
    ///
    /// Token rotation (access/refresh token, expiry) is excluded so a refresh
    /// persisted by the adapter itself does not restart the adapter.
    pub fn fingerprint(&self) -> String {
        let mut copy = self.clone();
        if let Some(o) = copy.oauth.as_mut() {
            o.access_token.clear();
            o.refresh_token.clear();
            o.expires_at = None;
        }
        serde_json::to_string(&copy).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
