//! SMTP delivery for one account.
//!
//! Password and OAuth accounts go through lettre's pooled
//! [`AsyncSmtpTransport`]. CRAM-MD5 accounts, which lettre cannot
//! authenticate, go through mail-send with one session per message.
//! Either way at most `max_conns` transactions run at once and callers
//! wait up to `pool_wait_timeout` for a slot.

use std::sync::Arc;
use std::time::Duration;

use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mail_send::smtp::message::Message as Submission;
use mail_send::SmtpClientBuilder;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use deskmail_core::models::{AuthProtocol, SmtpConfig, TlsType};
use deskmail_core::ChannelError;

use super::oauth::TokenManager;

/// Per-command timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

type Transport = AsyncSmtpTransport<Tokio1Executor>;

// ─────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────

/// Map a negative reply code onto the error taxonomy.
pub fn classify_code(code: u16, detail: String) -> ChannelError {
    match code {
        530 | 534 | 535 | 538 => ChannelError::Auth(detail),
        550 | 551 | 553 => ChannelError::RejectedRecipient(detail),
        452 | 552 => ChannelError::Quota(detail),
        400..=499 => ChannelError::Network(detail),
        _ => ChannelError::Protocol(detail),
    }
}

fn from_lettre(err: lettre::transport::smtp::Error) -> ChannelError {
    let detail = err.to_string();
    let code = err
        .status()
        .and_then(|status| status.to_string().parse::<u16>().ok());
    match code {
        Some(code) => classify_code(code, detail),
        None if err.is_client() => ChannelError::Protocol(detail),
        None => ChannelError::Network(detail),
    }
}

fn from_mail_send(err: mail_send::Error) -> ChannelError {
    let detail = err.to_string();
    match &err {
        mail_send::Error::AuthenticationFailed(_) => ChannelError::Auth(detail),
        mail_send::Error::UnexpectedReply(reply) => classify_code(reply.code(), detail),
        mail_send::Error::Io(_) | mail_send::Error::Timeout => ChannelError::Network(detail),
        _ => ChannelError::Protocol(detail),
    }
}

fn envelope(from: &str, recipients: &[String]) -> Result<Envelope, ChannelError> {
    let sender = from
        .parse::<Address>()
        .map_err(|e| ChannelError::Config(format!("invalid sender '{from}': {e}")))?;
    let to = recipients
        .iter()
        .map(|rcpt| {
            rcpt.parse::<Address>().map_err(|e| {
                ChannelError::RejectedRecipient(format!("invalid recipient '{rcpt}': {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Envelope::new(Some(sender), to).map_err(|e| ChannelError::RejectedRecipient(e.to_string()))
}

// ─────────────────────────────────────────────
// SmtpSender
// ─────────────────────────────────────────────

/// Outgoing mail for one SMTP config.
pub struct SmtpSender {
    config: SmtpConfig,
    oauth: Option<Arc<TokenManager>>,
    permits: Arc<Semaphore>,
    /// Pooled transport and the access token it authenticates with.
    transport: Mutex<Option<(Option<String>, Transport)>>,
}

impl SmtpSender {
    /// `config` must carry opened (plaintext) credentials.
    pub fn new(config: SmtpConfig, oauth: Option<Arc<TokenManager>>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_conns.max(1)));
        Self {
            config,
            oauth,
            permits,
            transport: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Whether sessions go through mail-send instead of the lettre pool.
    fn uses_cram(&self) -> bool {
        self.oauth.is_none() && self.config.auth_protocol == AuthProtocol::Cram
    }

    fn has_password_auth(&self) -> bool {
        self.config.auth_protocol != AuthProtocol::None && !self.config.username.is_empty()
    }

    /// Deliver one message. Returns the envelope recipients, all of which
    /// the server accepted.
    ///
    /// Nothing is resent once the server has seen MAIL FROM; a lost
    /// connection after that point surfaces as a `Network` error and the
    /// retry belongs to the dispatcher.
    pub async fn send(
        &self,
        from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<Vec<String>, ChannelError> {
        let envelope = envelope(from, recipients)?;

        let wait = self.config.pool_wait_timeout();
        let _permit = tokio::time::timeout(wait, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                ChannelError::Network(format!(
                    "no SMTP connection to {} available within {wait:?}",
                    self.config.host
                ))
            })?
            .map_err(|_| ChannelError::Network("SMTP sender closed".into()))?;

        if self.uses_cram() {
            self.send_cram(from, recipients, body).await?;
        } else {
            self.send_pooled(&envelope, body).await?;
        }
        Ok(recipients.to_vec())
    }

    async fn send_pooled(&self, envelope: &Envelope, body: &[u8]) -> Result<(), ChannelError> {
        let Some(mgr) = &self.oauth else {
            let transport = self.transport(None).await?;
            transport
                .send_raw(envelope, body)
                .await
                .map_err(from_lettre)?;
            return Ok(());
        };

        // AUTH runs before MAIL FROM, so a rejected token never leaves a
        // half-sent message behind.
        let token = mgr.access_token().await?;
        let transport = self.transport(Some(&token)).await?;
        match transport.send_raw(envelope, body).await.map_err(from_lettre) {
            Err(ChannelError::Auth(reason)) => {
                warn!(host = %self.config.host, reason = %reason, "SMTP rejected OAuth token, refreshing");
                let fresh = mgr.force_refresh(&token).await?;
                let transport = self.transport(Some(&fresh)).await?;
                transport
                    .send_raw(envelope, body)
                    .await
                    .map_err(from_lettre)?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// The pooled transport for `token`, rebuilt when the token changed.
    async fn transport(&self, token: Option<&str>) -> Result<Transport, ChannelError> {
        let mut cached = self.transport.lock().await;
        if let Some((built_with, transport)) = cached.as_ref() {
            if built_with.as_deref() == token {
                return Ok(transport.clone());
            }
            debug!(host = %self.config.host, "access token changed, rebuilding SMTP transport");
        }
        let transport = self.build_transport(token)?;
        *cached = Some((token.map(String::from), transport.clone()));
        Ok(transport)
    }

    fn build_transport(&self, token: Option<&str>) -> Result<Transport, ChannelError> {
        let cfg = &self.config;
        let pool = PoolConfig::new()
            .max_size(u32::try_from(cfg.max_conns.max(1)).unwrap_or(u32::MAX))
            .idle_timeout(cfg.idle_timeout());

        let mut builder = Transport::builder_dangerous(cfg.host.as_str())
            .port(cfg.port)
            .tls(self.tls()?)
            .hello_name(ClientId::Domain(cfg.hello_name().to_string()))
            .timeout(Some(SMTP_TIMEOUT))
            .pool_config(pool);

        if let Some(token) = token {
            builder = builder
                .credentials(Credentials::new(cfg.username.clone(), token.to_string()))
                .authentication(vec![Mechanism::Xoauth2]);
        } else if self.has_password_auth() {
            let mechanism = match cfg.auth_protocol {
                AuthProtocol::Login => Mechanism::Login,
                _ => Mechanism::Plain,
            };
            builder = builder
                .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
                .authentication(vec![mechanism]);
        }
        Ok(builder.build())
    }

    fn tls(&self) -> Result<Tls, ChannelError> {
        let cfg = &self.config;
        if cfg.tls_type == TlsType::None {
            return Ok(Tls::None);
        }
        if cfg.tls_skip_verify {
            warn!(host = %cfg.host, "TLS certificate verification disabled");
        }
        let params = TlsParameters::builder(cfg.host.clone())
            .dangerous_accept_invalid_certs(cfg.tls_skip_verify)
            .build_rustls()
            .map_err(|e| ChannelError::Config(format!("TLS setup for {}: {e}", cfg.host)))?;
        Ok(match cfg.tls_type {
            TlsType::Tls => Tls::Wrapper(params),
            _ => Tls::Required(params),
        })
    }

    // ─────────────────────────────────────────
    // CRAM-MD5
    // ─────────────────────────────────────────

    fn cram_builder(&self) -> SmtpClientBuilder<String> {
        let cfg = &self.config;
        let mut builder = SmtpClientBuilder::new(cfg.host.clone(), cfg.port)
            .implicit_tls(cfg.tls_type == TlsType::Tls)
            .helo_host(cfg.hello_name())
            .timeout(SMTP_TIMEOUT)
            .credentials((cfg.username.clone(), cfg.password.clone()));
        if cfg.tls_skip_verify {
            builder = builder.allow_invalid_certs();
        }
        builder
    }

    async fn send_cram(
        &self,
        from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<(), ChannelError> {
        let mut submission = Submission::empty().from(from).body(body);
        for rcpt in recipients {
            submission = submission.to(rcpt.as_str());
        }

        let builder = self.cram_builder();
        if self.config.tls_type == TlsType::None {
            let mut client = builder.connect_plain().await.map_err(from_mail_send)?;
            client.send(submission).await.map_err(from_mail_send)?;
            if let Err(e) = client.quit().await {
                debug!(error = %e, "SMTP QUIT failed");
            }
        } else {
            let mut client = builder.connect().await.map_err(from_mail_send)?;
            client.send(submission).await.map_err(from_mail_send)?;
            if let Err(e) = client.quit().await {
                debug!(error = %e, "SMTP QUIT failed");
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────
    // Checks
    // ─────────────────────────────────────────

    /// Connect, negotiate TLS and authenticate without sending anything.
    pub async fn verify(&self) -> Result<(), ChannelError> {
        if self.uses_cram() {
            let builder = self.cram_builder();
            if self.config.tls_type == TlsType::None {
                let client = builder.connect_plain().await.map_err(from_mail_send)?;
                let _ = client.quit().await;
            } else {
                let client = builder.connect().await.map_err(from_mail_send)?;
                let _ = client.quit().await;
            }
            return Ok(());
        }

        let token = match &self.oauth {
            Some(mgr) => Some(mgr.access_token().await?),
            None => None,
        };
        let connected = self
            .build_transport(token.as_deref())?
            .test_connection()
            .await
            .map_err(from_lettre)?;
        if !connected {
            return Err(ChannelError::Network(format!(
                "{} did not answer NOOP",
                self.config.host
            )));
        }
        Ok(())
    }

    /// Drop pooled connections and refuse further sends.
    pub async fn close(&self) {
        self.permits.close();
        if self.transport.lock().await.take().is_some() {
            debug!(host = %self.config.host, "SMTP pool closed");
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
