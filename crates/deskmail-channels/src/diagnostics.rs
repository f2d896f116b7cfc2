//! Test Connection — one-shot IMAP/SMTP checks for an inbox config.
//!
//! Each check runs on its own fresh connection (never an inbox's pool) and
//! returns a timestamped step log so an administrator can see exactly
//! where a configuration breaks.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use deskmail_core::models::{AuthProtocol, ImapConfig, SmtpConfig, TlsType};
use deskmail_core::ChannelError;

use crate::email::imap::ImapClient;
use crate::email::smtp::SmtpSender;

/// What to test. Secrets are plaintext here; nothing is persisted.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TestRequest {
    pub imap: Option<ImapConfig>,
    pub smtp: Option<SmtpConfig>,
    /// When set, the SMTP check also sends a test message here.
    pub test_email: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TestResponse {
    pub success: bool,
    pub imap_logs: Vec<String>,
    pub smtp_logs: Vec<String>,
}

/// Accumulates `[HH:MM:SS] message` lines.
#[derive(Default)]
struct StepLog {
    lines: Vec<String>,
}

impl StepLog {
    fn push(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        debug!(step = msg, "connection test");
        self.lines
            .push(format!("[{}] {}", Local::now().format("%H:%M:%S"), msg));
    }
}

/// Run every requested check. Success means all of them passed.
pub async fn test_connection(req: &TestRequest) -> TestResponse {
    let mut resp = TestResponse {
        success: true,
        ..Default::default()
    };

    if let Some(imap) = &req.imap {
        let (ok, logs) = test_imap(imap).await;
        resp.success &= ok;
        resp.imap_logs = logs;
    }
    if let Some(smtp) = &req.smtp {
        let (ok, logs) = test_smtp(smtp, req.test_email.as_deref()).await;
        resp.success &= ok;
        resp.smtp_logs = logs;
    }

    info!(success = resp.success, "connection test finished");
    resp
}

// ─────────────────────────────────────────────
// IMAP
// ─────────────────────────────────────────────

/// Connect, log in, and open the mailbox read-only.
pub async fn test_imap(cfg: &ImapConfig) -> (bool, Vec<String>) {
    let mut log = StepLog::default();
    let ok = run_imap(cfg, &mut log).await;
    (ok, log.lines)
}

async fn run_imap(cfg: &ImapConfig, log: &mut StepLog) -> bool {
    log.push(format!("Connecting to IMAP server: {}:{}", cfg.host, cfg.port));
    log.push(match cfg.tls_type {
        TlsType::None => "Using plain connection (no TLS)",
        TlsType::Starttls => "Using STARTTLS connection",
        TlsType::Tls => "Using SSL/TLS connection",
    });

    let mut client = match ImapClient::connect(cfg).await {
        Ok(c) => c,
        Err(e) => {
            log.push(format!("Connection failed: {e}"));
            return false;
        }
    };
    log.push("Connected successfully");

    log.push(format!("Authenticating as: {}", cfg.username));
    if let Err(e) = client.login(&cfg.username, &cfg.password).await {
        log.push(format!("Authentication failed: {e}"));
        return false;
    }
    log.push("Authentication successful");

    log.push(format!("Selecting mailbox: {}", cfg.mailbox));
    let status = match client.examine(&cfg.mailbox).await {
        Ok(s) => s,
        Err(e) => {
            log.push(format!("Failed to select mailbox: {e}"));
            let _ = client.logout().await;
            return false;
        }
    };
    log.push(format!("Mailbox selected - {} messages", status.exists));

    let _ = client.logout().await;
    log.push("IMAP test completed successfully!");
    true
}

// ─────────────────────────────────────────────
// SMTP
// ─────────────────────────────────────────────

/// Connect, negotiate TLS, authenticate, and optionally send a test
/// message to `test_email`.
pub async fn test_smtp(cfg: &SmtpConfig, test_email: Option<&str>) -> (bool, Vec<String>) {
    let mut log = StepLog::default();
    let ok = run_smtp(cfg, test_email, &mut log).await;
    (ok, log.lines)
}

async fn run_smtp(cfg: &SmtpConfig, test_email: Option<&str>, log: &mut StepLog) -> bool {
    log.push(format!("Connecting to SMTP server: {}:{}", cfg.host, cfg.port));
    log.push(match cfg.tls_type {
        TlsType::None => "Using plain connection",
        TlsType::Starttls => "Using STARTTLS connection",
        TlsType::Tls => "Using SSL/TLS connection",
    });
    log.push(format!("Sending EHLO {}", cfg.hello_name()));

    let mut cfg = cfg.clone();
    if cfg.password.is_empty() {
        cfg.auth_protocol = AuthProtocol::None;
    }
    let authenticates = cfg.auth_protocol != AuthProtocol::None && !cfg.username.is_empty();
    if authenticates {
        log.push(format!(
            "Authenticating as {} using {}",
            cfg.username, cfg.auth_protocol
        ));
    } else {
        log.push("No authentication required");
    }

    // A throwaway sender: the check never touches a live inbox's pool.
    let sender = SmtpSender::new(cfg.clone(), None);
    if let Err(e) = sender.verify().await {
        log.push(match e {
            ChannelError::Auth(_) => format!("Authentication failed: {e}"),
            _ => format!("Connection failed: {e}"),
        });
        return false;
    }
    log.push("Connected successfully");
    if authenticates {
        log.push("Authentication successful");
    }

    if let Some(to) = test_email.map(str::trim).filter(|t| !t.is_empty()) {
        log.push(format!("Sending test email to {to}"));
        let body = test_message(&cfg.username, to);
        let result = sender
            .send(&cfg.username, &[to.to_string()], body.as_bytes())
            .await;
        sender.close().await;
        if let Err(e) = result {
            log.push(format!("Failed to send test email: {e}"));
            return false;
        }
        log.push("Test email sent successfully!");
    }

    log.push("SMTP test completed successfully!");
    true
}

fn test_message(from: &str, to: &str) -> String {
    let now = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: Deskmail Inbox SMTP Test\r\n\
         Date: {now}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         \r\n\
         This is a test email from Deskmail inbox SMTP configuration.\r\n\
         Sent at: {now}\r\n"
    )
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
