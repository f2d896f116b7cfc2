//! Email channel — IMAP polling for inbound mail, pooled SMTP for replies.
//!
//! One [`EmailChannel`] serves one inbox. Every IMAP config gets its own
//! poller task; every SMTP config gets its own [`SmtpSender`], picked
//! round-robin on send. OAuth inboxes share a single [`TokenManager`]
//! between all of them.

pub mod compose;
pub mod imap;
pub mod oauth;
pub mod parse;
pub mod smtp;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deskmail_core::bus::{DeliveryReceipt, IngestQueue, OutgoingMessage};
use deskmail_core::models::{ChannelKind, EmailConfig, ImapConfig, Inbox};
use deskmail_core::utils::{backoff_delay, extract_email_address};
use deskmail_core::ChannelError;

use crate::base::{Channel, ChannelContext, ErrorReporter};
use compose::compose;
use imap::ImapClient;
use oauth::TokenManager;
use parse::parse_message;
use smtp::SmtpSender;

/// Poll retry backoff bounds.
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);

/// Consecutive password LOGIN rejections before a poller gives up.
const MAX_PASSWORD_AUTH_FAILURES: u32 = 2;

// ─────────────────────────────────────────────
// EmailChannel
// ─────────────────────────────────────────────

pub struct EmailChannel {
    inbox_id: i64,
    /// Default From for messages that carry none.
    from: String,
    imap: Vec<ImapConfig>,
    smtp: Vec<Arc<SmtpSender>>,
    next_smtp: AtomicUsize,
    oauth: Option<Arc<TokenManager>>,
    report_error: ErrorReporter,
    retry_ceiling: Option<u32>,
}

impl EmailChannel {
    /// Decode, validate and decrypt the inbox config.
    pub fn from_inbox(inbox: &Inbox, ctx: ChannelContext) -> Result<Self, ChannelError> {
        let mut sealed = inbox.email_config()?;
        sealed.trim();
        sealed.validate()?;
        let config = ctx
            .cipher
            .open_email_config(&sealed)
            .map_err(|e| ChannelError::Config(format!("inbox {}: {e}", inbox.id)))?;

        let oauth = match (&config.oauth, config.is_oauth()) {
            (Some(o), true) => Some(Arc::new(TokenManager::new(
                inbox.id,
                o.clone(),
                ctx.refresh_lock.clone(),
                ctx.persist_token.clone(),
            ))),
            _ => None,
        };

        let from = if config.from.is_empty() {
            inbox.from.clone()
        } else {
            config.from.clone()
        };
        Ok(Self::new(inbox.id, from, config, oauth, ctx.report_error))
    }

    /// Build from an already opened (plaintext) config.
    pub fn new(
        inbox_id: i64,
        from: String,
        config: EmailConfig,
        oauth: Option<Arc<TokenManager>>,
        report_error: ErrorReporter,
    ) -> Self {
        let retry_ceiling = config
            .smtp
            .iter()
            .map(|s| s.max_msg_retries.max(1))
            .max();
        let smtp = config
            .smtp
            .into_iter()
            .map(|s| Arc::new(SmtpSender::new(s, oauth.clone())))
            .collect();

        Self {
            inbox_id,
            from,
            imap: config.imap,
            smtp,
            next_smtp: AtomicUsize::new(0),
            oauth,
            report_error,
            retry_ceiling,
        }
    }

    fn pick_sender(&self) -> Option<&Arc<SmtpSender>> {
        if self.smtp.is_empty() {
            return None;
        }
        let idx = self.next_smtp.fetch_add(1, Ordering::Relaxed) % self.smtp.len();
        self.smtp.get(idx)
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn inbox_id(&self) -> i64 {
        self.inbox_id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn receive(
        &self,
        queue: Arc<IngestQueue>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        if self.imap.is_empty() {
            info!(inbox_id = self.inbox_id, "no IMAP configured, inbox is send-only");
            cancel.cancelled().await;
            return Ok(());
        }

        let mut pollers = JoinSet::new();
        for cfg in &self.imap {
            let poller = ImapPoller::new(
                self.inbox_id,
                cfg.clone(),
                self.oauth.clone(),
                self.report_error.clone(),
            );
            pollers.spawn(poller.run(queue.clone(), cancel.clone()));
        }

        while let Some(res) = pollers.join_next().await {
            if let Err(e) = res {
                error!(inbox_id = self.inbox_id, error = %e, "IMAP poller task failed");
            }
        }
        Ok(())
    }

    async fn send(&self, msg: &OutgoingMessage) -> Result<DeliveryReceipt, ChannelError> {
        let sender = self
            .pick_sender()
            .ok_or_else(|| ChannelError::Config("inbox has no SMTP server configured".into()))?;

        let recipients = msg.envelope_recipients();
        if recipients.is_empty() {
            return Err(ChannelError::RejectedRecipient("message has no recipients".into()));
        }

        let mut msg = msg.clone();
        if msg.from.trim().is_empty() {
            msg.from = self.from.clone();
        }
        let composed = compose(&msg)?;
        let envelope_from = extract_email_address(&msg.from);

        let accepted = sender
            .send(&envelope_from, &recipients, &composed.bytes)
            .await?;

        info!(
            inbox_id = self.inbox_id,
            message_id = msg.message_id,
            smtp = %sender.config().host,
            recipients = accepted.len(),
            "email sent"
        );
        Ok(DeliveryReceipt {
            message_id_header: composed.message_id,
            accepted,
        })
    }

    fn retry_ceiling(&self) -> Option<u32> {
        self.retry_ceiling
    }

    async fn close(&self) {
        for sender in &self.smtp {
            sender.close().await;
        }
        debug!(inbox_id = self.inbox_id, "email channel closed");
    }
}

// ─────────────────────────────────────────────
// Failure policy
// ─────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Retry(Duration),
    Fatal,
}

/// Consecutive-failure bookkeeping for one poller.
#[derive(Debug)]
struct FailureTracker {
    failures: u32,
    auth_failures: u32,
    auth_limit: u32,
    base: Duration,
    max: Duration,
}

impl FailureTracker {
    /// OAuth pollers have already forced a refresh before an auth error
    /// surfaces, so the first one is fatal.
    fn new(oauth: bool) -> Self {
        Self {
            failures: 0,
            auth_failures: 0,
            auth_limit: if oauth { 1 } else { MAX_PASSWORD_AUTH_FAILURES },
            base: RETRY_BASE,
            max: RETRY_MAX,
        }
    }

    fn success(&mut self) {
        self.failures = 0;
        self.auth_failures = 0;
    }

    fn failure(&mut self, err: &ChannelError) -> Verdict {
        self.failures += 1;
        if err.is_auth() {
            self.auth_failures += 1;
            if self.auth_failures >= self.auth_limit {
                return Verdict::Fatal;
            }
        } else {
            self.auth_failures = 0;
        }
        Verdict::Retry(backoff_delay(self.failures, self.base, self.max))
    }
}

// ─────────────────────────────────────────────
// ImapPoller
// ─────────────────────────────────────────────

/// Highest UID handed to the ingestion queue, scoped to a UIDVALIDITY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Watermark {
    uid_validity: u32,
    last_uid: u32,
}

struct ImapPoller {
    inbox_id: i64,
    config: ImapConfig,
    oauth: Option<Arc<TokenManager>>,
    report_error: ErrorReporter,
    watermark: Option<Watermark>,
}

impl ImapPoller {
    fn new(
        inbox_id: i64,
        config: ImapConfig,
        oauth: Option<Arc<TokenManager>>,
        report_error: ErrorReporter,
    ) -> Self {
        Self {
            inbox_id,
            config,
            oauth,
            report_error,
            watermark: None,
        }
    }

    async fn run(mut self, queue: Arc<IngestQueue>, cancel: CancellationToken) {
        let interval = self.config.read_interval();
        info!(
            inbox_id = self.inbox_id,
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            interval_secs = interval.as_secs(),
            "starting IMAP poller"
        );

        let mut tracker = FailureTracker::new(self.oauth.is_some());
        loop {
            let delay = match self.poll_once(&queue, &cancel).await {
                Ok(count) => {
                    tracker.success();
                    if count > 0 {
                        debug!(inbox_id = self.inbox_id, count, "fetched new mail");
                    }
                    interval
                }
                Err(e) => match tracker.failure(&e) {
                    Verdict::Retry(delay) => {
                        warn!(
                            inbox_id = self.inbox_id,
                            host = %self.config.host,
                            error = %e,
                            retry_in_secs = delay.as_secs(),
                            "IMAP poll failed"
                        );
                        if matches!(e, ChannelError::TokenPersist(_)) {
                            (self.report_error)(self.inbox_id, e.to_string()).await;
                        }
                        delay
                    }
                    Verdict::Fatal => {
                        let reason = format!(
                            "IMAP {}@{} stopped: {e}",
                            self.config.username, self.config.host
                        );
                        error!(inbox_id = self.inbox_id, error = %e, "IMAP authentication keeps failing, stopping poller");
                        (self.report_error)(self.inbox_id, reason).await;
                        return;
                    }
                },
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!(inbox_id = self.inbox_id, host = %self.config.host, "IMAP poller shutting down");
                    return;
                }
            }
        }
    }

    async fn authenticate(&self, client: &mut ImapClient) -> Result<(), ChannelError> {
        let user = &self.config.username;
        let Some(mgr) = &self.oauth else {
            return client.login(user, &self.config.password).await;
        };

        let token = mgr.access_token().await?;
        match client.authenticate_xoauth2(user, &token).await {
            Err(e) if e.is_auth() => {
                warn!(inbox_id = self.inbox_id, error = %e, "IMAP rejected OAuth token, refreshing");
                let fresh = mgr.force_refresh(&token).await?;
                client.authenticate_xoauth2(user, &fresh).await
            }
            other => other,
        }
    }

    /// One cycle: connect, authenticate, EXAMINE, search, fetch and publish.
    /// Returns the number of messages published.
    async fn poll_once(
        &mut self,
        queue: &IngestQueue,
        cancel: &CancellationToken,
    ) -> Result<usize, ChannelError> {
        let mut client = ImapClient::connect(&self.config).await?;
        self.authenticate(&mut client).await?;

        let status = client.examine(&self.config.mailbox).await?;
        let validity = status.uid_validity.unwrap_or(0);
        if let Some(w) = self.watermark {
            if w.uid_validity != validity {
                warn!(
                    inbox_id = self.inbox_id,
                    mailbox = %self.config.mailbox,
                    old = w.uid_validity,
                    new = validity,
                    "UIDVALIDITY changed, rescanning from horizon"
                );
                self.watermark = None;
            }
        }

        let mut uids = match self.watermark {
            Some(w) => client
                .uid_search(&format!("UID {}:*", w.last_uid + 1))
                .await?
                .into_iter()
                // `n:*` always matches the last message, even below n
                .filter(|uid| *uid > w.last_uid)
                .collect(),
            None => client.uid_search(&format!("SINCE {}", self.horizon())).await?,
        };
        uids.sort_unstable();
        uids.dedup();

        if uids.is_empty() && self.watermark.is_none() {
            if let Some(next) = status.uid_next {
                self.watermark = Some(Watermark {
                    uid_validity: validity,
                    last_uid: next.saturating_sub(1),
                });
            }
        }

        let mut published = 0;
        for uid in uids {
            if cancel.is_cancelled() {
                break;
            }
            let Some(raw) = client.uid_fetch(uid).await? else {
                // expunged between SEARCH and FETCH, or too large to ingest
                self.advance(validity, uid);
                continue;
            };

            let (host, mailbox) = (&self.config.host, &self.config.mailbox);
            let fallback = || format!("imap:{host}:{mailbox}:{validity}:{uid}");
            match parse_message(self.inbox_id, &raw, fallback) {
                Ok(msg) => {
                    tokio::select! {
                        res = queue.publish(msg) => {
                            res.map_err(|_| ChannelError::Network("ingestion queue closed".into()))?;
                        }
                        _ = cancel.cancelled() => break,
                    }
                    published += 1;
                }
                Err(e) => {
                    warn!(inbox_id = self.inbox_id, uid, error = %e, "skipping unparseable message");
                }
            }
            self.advance(validity, uid);
        }

        if let Err(e) = client.logout().await {
            debug!(error = %e, "IMAP logout error (non-fatal)");
        }
        Ok(published)
    }

    fn advance(&mut self, uid_validity: u32, uid: u32) {
        let last_uid = self.watermark.map_or(0, |w| w.last_uid).max(uid);
        self.watermark = Some(Watermark {
            uid_validity,
            last_uid,
        });
    }

    /// IMAP date for `SINCE`: now minus `scan_inbox_since`.
    fn horizon(&self) -> String {
        let since = chrono::Duration::from_std(self.config.scan_inbox_since())
            .unwrap_or_else(|_| chrono::Duration::hours(48));
        (Utc::now() - since).format("%d-%b-%Y").to_string()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BoxFuture;
    use deskmail_core::crypto::CredentialCipher;
    use deskmail_core::models::{AuthProtocol, OAuthConfig, OAuthProvider, SmtpConfig};
    use imap::tests::{fake_imap, local_config};
    use tokio::sync::Mutex;

    fn recording_reporter(errors: Arc<Mutex<Vec<String>>>) -> ErrorReporter {
        Arc::new(move |_inbox_id: i64, reason: String| -> BoxFuture<'static, ()> {
            let errors = errors.clone();
            Box::pin(async move { errors.lock().await.push(reason) })
        })
    }

    fn context(cipher: Arc<CredentialCipher>) -> ChannelContext {
        ChannelContext {
            cipher,
            refresh_lock: Arc::default(),
            persist_token: Arc::new(
                |_id: i64, _cfg: OAuthConfig| -> BoxFuture<'static, Result<(), ChannelError>> {
                    Box::pin(async { Ok(()) })
                },
            ),
            report_error: recording_reporter(Arc::default()),
        }
    }

    fn inbox(config: serde_json::Value) -> Inbox {
        Inbox {
            id: 4,
            name: "Support".into(),
            channel: ChannelKind::Email,
            enabled: true,
            from: "Acme Support <help@acme.io>".into(),
            config,
            last_error: None,
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn mail(id: &str) -> String {
        format!("From: Alice <alice@example.com>\r\nMessage-ID: <{id}@example.com>\r\nSubject: Help\r\n\r\nHi\r\n")
    }

    fn fetch_reply(uid: u32, body: &str) -> String {
        format!(
            "* 1 FETCH (UID {uid} BODY[] {{{}}}\r\n{body})\r\n{{tag}} OK fetched\r\n",
            body.len()
        )
    }

    fn examine_reply(validity: u32, next: u32) -> String {
        format!("* OK [UIDVALIDITY {validity}] ok\r\n* OK [UIDNEXT {next}] next\r\n{{tag}} OK [READ-ONLY] done\r\n")
    }

    #[test]
    fn test_from_inbox_opens_sealed_secrets() {
        let cipher = Arc::new(CredentialCipher::new("test-key").unwrap());
        let cfg = EmailConfig {
            imap: vec![ImapConfig {
                host: " imap.acme.io ".into(),
                password: "imap-pass".into(),
                ..Default::default()
            }],
            smtp: vec![
                SmtpConfig {
                    host: "smtp1.acme.io".into(),
                    max_msg_retries: 2,
                    ..Default::default()
                },
                SmtpConfig {
                    host: "smtp2.acme.io".into(),
                    max_msg_retries: 4,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let sealed = cipher.seal_email_config(&cfg).unwrap();
        let inbox = inbox(serde_json::to_value(&sealed).unwrap());

        let ch = EmailChannel::from_inbox(&inbox, context(cipher)).unwrap();
        assert_eq!(ch.imap[0].password, "imap-pass");
        assert_eq!(ch.imap[0].host, "imap.acme.io");
        assert_eq!(ch.from, "Acme Support <help@acme.io>");
        assert_eq!(ch.retry_ceiling(), Some(4));
        assert!(ch.oauth.is_none());
    }

    #[test]
    fn test_from_inbox_rejects_invalid_config() {
        let cipher = Arc::new(CredentialCipher::new("test-key").unwrap());
        let inbox = inbox(serde_json::json!({ "smtp": [{ "host": "" }] }));
        let err = EmailChannel::from_inbox(&inbox, context(cipher)).err().unwrap();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn test_failure_tracker_password() {
        let mut t = FailureTracker::new(false);
        let auth = ChannelError::Auth("NO".into());
        assert_eq!(t.failure(&auth), Verdict::Retry(RETRY_BASE));
        assert_eq!(t.failure(&auth), Verdict::Fatal);

        let mut t = FailureTracker::new(false);
        t.failure(&auth);
        t.success();
        assert!(matches!(t.failure(&auth), Verdict::Retry(_)));
    }

    #[test]
    fn test_failure_tracker_backoff_and_oauth() {
        let mut t = FailureTracker::new(false);
        let net = ChannelError::Network("reset".into());
        assert_eq!(t.failure(&net), Verdict::Retry(Duration::from_secs(5)));
        assert_eq!(t.failure(&net), Verdict::Retry(Duration::from_secs(10)));
        for _ in 0..10 {
            t.failure(&net);
        }
        assert_eq!(t.failure(&net), Verdict::Retry(RETRY_MAX));

        let mut t = FailureTracker::new(true);
        assert_eq!(t.failure(&ChannelError::Auth("x".into())), Verdict::Fatal);
    }

    #[tokio::test]
    async fn test_first_poll_scans_horizon_and_sets_watermark() {
        let (a, b) = (mail("a"), mail("b"));
        let (port, server) = fake_imap(vec![
            ("LOGIN", "{tag} OK logged in\r\n".into()),
            ("EXAMINE", examine_reply(7, 12)),
            ("UID SEARCH", "* SEARCH 11 10\r\n{tag} OK done\r\n".into()),
            ("UID FETCH", fetch_reply(10, &a)),
            ("UID FETCH", fetch_reply(11, &b)),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let queue = IngestQueue::new(8);
        let mut poller = ImapPoller::new(4, local_config(port), None, recording_reporter(Arc::default()));
        let n = poller.poll_once(&queue, &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            poller.watermark,
            Some(Watermark {
                uid_validity: 7,
                last_uid: 11
            })
        );

        let first = queue.consume().await.unwrap();
        assert_eq!(first.source_id, "<a@example.com>");
        assert_eq!(first.inbox_id, 4);
        assert_eq!(queue.consume().await.unwrap().source_id, "<b@example.com>");

        let received = server.await.unwrap();
        assert!(received[2].contains("UID SEARCH SINCE "));
    }

    #[tokio::test]
    async fn test_later_poll_searches_above_watermark() {
        let (port, server) = fake_imap(vec![
            ("LOGIN", "{tag} OK logged in\r\n".into()),
            ("EXAMINE", examine_reply(7, 13)),
            // server echoes the last message even when below the range
            ("UID SEARCH", "* SEARCH 11\r\n{tag} OK done\r\n".into()),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let queue = IngestQueue::new(8);
        let mut poller = ImapPoller::new(4, local_config(port), None, recording_reporter(Arc::default()));
        poller.watermark = Some(Watermark {
            uid_validity: 7,
            last_uid: 11,
        });

        assert_eq!(poller.poll_once(&queue, &CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(queue.depth(), 0);
        let received = server.await.unwrap();
        assert!(received[2].ends_with("UID SEARCH UID 12:*"));
    }

    #[tokio::test]
    async fn test_uidvalidity_change_rescans() {
        let (port, server) = fake_imap(vec![
            ("LOGIN", "{tag} OK logged in\r\n".into()),
            ("EXAMINE", examine_reply(99, 5)),
            ("UID SEARCH", "* SEARCH\r\n{tag} OK done\r\n".into()),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let queue = IngestQueue::new(8);
        let mut poller = ImapPoller::new(4, local_config(port), None, recording_reporter(Arc::default()));
        poller.watermark = Some(Watermark {
            uid_validity: 7,
            last_uid: 500,
        });

        poller.poll_once(&queue, &CancellationToken::new()).await.unwrap();
        // empty horizon scan starts the new watermark at UIDNEXT-1
        assert_eq!(
            poller.watermark,
            Some(Watermark {
                uid_validity: 99,
                last_uid: 4
            })
        );
        let received = server.await.unwrap();
        assert!(received[2].contains("UID SEARCH SINCE "));
    }

    #[tokio::test]
    async fn test_oauth_rejection_forces_refresh() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let token_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&token_server)
            .await;

        let (port, server) = fake_imap(vec![
            ("AUTHENTICATE XOAUTH2", "+ eyJzdGF0dXMiOiI0MDEifQ==\r\n".into()),
            ("", "{tag} NO invalid token\r\n".into()),
            ("AUTHENTICATE XOAUTH2", "{tag} OK authenticated\r\n".into()),
            ("EXAMINE", examine_reply(1, 1)),
            ("UID SEARCH", "* SEARCH\r\n{tag} OK done\r\n".into()),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let oauth = OAuthConfig {
            provider: OAuthProvider::Google,
            client_id: "cid".into(),
            client_secret: "secret".into(),
            tenant_id: String::new(),
            access_token: "stale-token".into(),
            refresh_token: "rt".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        let ctx = context(Arc::new(CredentialCipher::new("k").unwrap()));
        let mgr = Arc::new(
            TokenManager::new(4, oauth, ctx.refresh_lock.clone(), ctx.persist_token.clone())
                .with_endpoint(token_server.uri()),
        );

        let queue = IngestQueue::new(8);
        let mut poller = ImapPoller::new(4, local_config(port), Some(mgr.clone()), ctx.report_error);
        poller.poll_once(&queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(mgr.snapshot().await.access_token, "fresh-token");
        let received = server.await.unwrap();
        assert_eq!(received.len(), 6);
    }

    #[tokio::test]
    async fn test_fatal_auth_reports_inbox_error() {
        // No refresh token: the forced refresh fails and the poller stops.
        let (port, _server) = fake_imap(vec![(
            "AUTHENTICATE XOAUTH2",
            "{tag} NO invalid token\r\n".into(),
        )])
        .await;

        let oauth = OAuthConfig {
            provider: OAuthProvider::Google,
            client_id: "cid".into(),
            client_secret: String::new(),
            tenant_id: String::new(),
            access_token: "stale".into(),
            refresh_token: String::new(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        let errors = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::new(CredentialCipher::new("k").unwrap()));
        let mgr = Arc::new(TokenManager::new(
            4,
            oauth,
            ctx.refresh_lock.clone(),
            ctx.persist_token.clone(),
        ));

        let poller = ImapPoller::new(4, local_config(port), Some(mgr), recording_reporter(errors.clone()));
        let queue = Arc::new(IngestQueue::new(1));
        tokio::time::timeout(Duration::from_secs(10), poller.run(queue, CancellationToken::new()))
            .await
            .unwrap();

        let errors = errors.lock().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("support@acme.io@127.0.0.1"));
    }

    #[tokio::test]
    async fn test_send_round_robins_senders() {
        use smtp::tests::FakeSmtp;

        let (p1, t1) = FakeSmtp::default().start().await;
        let (p2, t2) = FakeSmtp::default().start().await;

        let smtp = |port| SmtpConfig {
            host: "127.0.0.1".into(),
            port,
            auth_protocol: AuthProtocol::None,
            tls_type: deskmail_core::models::TlsType::None,
            ..Default::default()
        };
        let cfg = EmailConfig {
            smtp: vec![smtp(p1), smtp(p2)],
            ..Default::default()
        };
        let ch = EmailChannel::new(
            4,
            "help@acme.io".into(),
            cfg,
            None,
            recording_reporter(Arc::default()),
        );

        let msg = OutgoingMessage {
            message_id: 1,
            uuid: uuid::Uuid::new_v4(),
            inbox_id: 4,
            conversation_id: 1,
            from: String::new(),
            to: vec!["Alice <alice@example.com>".into()],
            cc: Vec::new(),
            bcc: vec!["audit@acme.io".into()],
            reply_to: None,
            subject: "Re: Help".into(),
            content: "On it".into(),
            content_type: Default::default(),
            text_content: "On it".into(),
            message_id_header: Some("<r1@acme.io>".into()),
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            attempt: 1,
        };

        let r1 = ch.send(&msg).await.unwrap();
        let r2 = ch.send(&msg).await.unwrap();
        assert_eq!(r1.message_id_header, "<r1@acme.io>");
        assert_eq!(r1.accepted, vec!["alice@example.com", "audit@acme.io"]);
        assert_eq!(r2.accepted.len(), 2);
        ch.close().await;

        for t in [t1, t2] {
            let t = t.lock().await;
            assert_eq!(t.messages.len(), 1);
            assert_eq!(t.count("MAIL FROM:<help@acme.io>"), 1);
            assert_eq!(t.count("RCPT TO:"), 2);
            // Bcc travels in the envelope only
            assert!(!t.messages[0].contains("audit@acme.io"));
        }
    }

    #[tokio::test]
    async fn test_send_without_smtp_is_permanent() {
        let ch = EmailChannel::new(
            4,
            "help@acme.io".into(),
            EmailConfig::default(),
            None,
            recording_reporter(Arc::default()),
        );
        let msg = OutgoingMessage {
            message_id: 1,
            uuid: uuid::Uuid::new_v4(),
            inbox_id: 4,
            conversation_id: 1,
            from: "help@acme.io".into(),
            to: vec!["alice@example.com".into()],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: "x".into(),
            content: "x".into(),
            content_type: Default::default(),
            text_content: "x".into(),
            message_id_header: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            attempt: 1,
        };
        let err = ch.send(&msg).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(ch.retry_ceiling(), None);
    }

    #[tokio::test]
    async fn test_send_only_inbox_receive_waits_for_cancel() {
        let ch = EmailChannel::new(
            4,
            "help@acme.io".into(),
            EmailConfig::default(),
            None,
            recording_reporter(Arc::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        ch.receive(Arc::new(IngestQueue::new(1)), cancel).await.unwrap();
    }
}
