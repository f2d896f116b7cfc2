//! Minimal async IMAP client.
//!
//! Supports only what polling needs: LOGIN, AUTHENTICATE XOAUTH2,
//! STARTTLS, EXAMINE, UID SEARCH, UID FETCH and LOGOUT.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::{debug, warn};

use deskmail_core::models::{ImapConfig, TlsType};
use deskmail_core::ChannelError;

use super::oauth::xoauth2_payload;
use crate::transport::{self, BoxedStream};

/// Per-read timeout once connected.
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest literal (message body) accepted from the server.
pub const MAX_LITERAL: usize = 50 * 1024 * 1024;

/// Result of EXAMINE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

pub struct ImapClient {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    tag_counter: u32,
    max_literal: usize,
}

impl ImapClient {
    /// Connect per the config's TLS mode and consume the greeting.
    pub async fn connect(cfg: &ImapConfig) -> Result<Self, ChannelError> {
        let stream =
            transport::connect(&cfg.host, cfg.port, cfg.tls_type, cfg.tls_skip_verify).await?;
        let mut client = Self::from_stream(stream, 0);

        let greeting = client.read_line().await?;
        let upper = greeting.to_ascii_uppercase();
        if !upper.starts_with("* OK") && !upper.starts_with("* PREAUTH") {
            return Err(ChannelError::Protocol(format!(
                "unexpected IMAP greeting: {greeting}"
            )));
        }
        debug!(host = %cfg.host, greeting = %greeting, "IMAP connected");

        if cfg.tls_type == TlsType::Starttls {
            client = client.starttls(&cfg.host, cfg.tls_skip_verify).await?;
        }
        Ok(client)
    }

    fn from_stream(stream: BoxedStream, tag_counter: u32) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
            tag_counter,
            max_literal: MAX_LITERAL,
        }
    }

    async fn starttls(mut self, host: &str, skip_verify: bool) -> Result<Self, ChannelError> {
        let tag = self.send_command("STARTTLS").await?;
        let (_, status) = self.read_response(&tag).await?;
        check_ok(&tag, &status, "STARTTLS")?;

        let Self {
            reader,
            writer,
            tag_counter,
            ..
        } = self;
        let stream = reader.into_inner().unsplit(writer);
        let tls = transport::upgrade(stream, host, skip_verify).await?;
        Ok(Self::from_stream(tls, tag_counter))
    }

    // ─────────────────────────────────────────
    // Wire helpers
    // ─────────────────────────────────────────

    /// Read a single CRLF-terminated line.
    async fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await??;
        if n == 0 {
            return Err(ChannelError::Network(
                "IMAP connection closed unexpectedly".into(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read exactly `n` bytes (a literal).
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
        if n > self.max_literal {
            return Err(ChannelError::Protocol(format!(
                "server announced a {n} byte literal, limit is {}",
                self.max_literal
            )));
        }
        let mut buf = vec![0u8; n];
        tokio::time::timeout(READ_TIMEOUT, self.reader.read_exact(&mut buf)).await??;
        Ok(buf)
    }

    /// Consume `n` literal bytes without buffering them.
    async fn discard(&mut self, n: usize) -> Result<(), ChannelError> {
        let mut literal = (&mut self.reader).take(n as u64);
        let copied = tokio::time::timeout(
            READ_TIMEOUT,
            tokio::io::copy(&mut literal, &mut tokio::io::sink()),
        )
        .await??;
        if copied < n as u64 {
            return Err(ChannelError::Network(
                "IMAP connection closed inside a literal".into(),
            ));
        }
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a tagged command. Returns the tag.
    async fn send_command(&mut self, cmd: &str) -> Result<String, ChannelError> {
        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);
        self.write_raw(format!("{tag} {cmd}\r\n").as_bytes()).await?;
        Ok(tag)
    }

    /// Read until the tagged completion line.
    /// Returns (untagged_lines, tagged_status_line).
    async fn read_response(&mut self, tag: &str) -> Result<(Vec<String>, String), ChannelError> {
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line().await?;
            if is_tagged(&line, tag) {
                return Ok((untagged, line));
            }
            untagged.push(line);
        }
    }

    // ─────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────

    pub async fn login(&mut self, user: &str, pass: &str) -> Result<(), ChannelError> {
        let cmd = format!("LOGIN {} {}", quote(user), quote(pass));
        let tag = self.send_command(&cmd).await?;
        let (_, status) = self.read_response(&tag).await?;
        check_ok(&tag, &status, "LOGIN").map_err(into_auth)
    }

    /// SASL XOAUTH2 with an initial response.
    pub async fn authenticate_xoauth2(
        &mut self,
        user: &str,
        access_token: &str,
    ) -> Result<(), ChannelError> {
        let cmd = format!("AUTHENTICATE XOAUTH2 {}", xoauth2_payload(user, access_token));
        let tag = self.send_command(&cmd).await?;
        loop {
            let line = self.read_line().await?;
            if line.starts_with('+') {
                // Error details arrive as a challenge; an empty reply ends the exchange.
                self.write_raw(b"\r\n").await?;
                continue;
            }
            if is_tagged(&line, &tag) {
                return check_ok(&tag, &line, "AUTHENTICATE").map_err(into_auth);
            }
        }
    }

    /// Open a mailbox read-only.
    pub async fn examine(&mut self, mailbox: &str) -> Result<MailboxStatus, ChannelError> {
        let tag = self.send_command(&format!("EXAMINE {}", quote(mailbox))).await?;
        let (lines, status) = self.read_response(&tag).await?;
        check_ok(&tag, &status, "EXAMINE")?;

        let mut result = MailboxStatus::default();
        for line in &lines {
            let upper = line.to_ascii_uppercase();
            if upper.ends_with(" EXISTS") {
                if let Some(n) = line.split_whitespace().nth(1).and_then(|s| s.parse().ok()) {
                    result.exists = n;
                }
            }
            if let Some(v) = bracket_value(&upper, "UIDVALIDITY") {
                result.uid_validity = Some(v);
            }
            if let Some(v) = bracket_value(&upper, "UIDNEXT") {
                result.uid_next = Some(v);
            }
        }
        Ok(result)
    }

    /// `UID SEARCH <criteria>` — returns UIDs in server order.
    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, ChannelError> {
        let tag = self.send_command(&format!("UID SEARCH {criteria}")).await?;
        let (lines, status) = self.read_response(&tag).await?;
        check_ok(&tag, &status, "SEARCH")?;

        let mut uids = Vec::new();
        for line in &lines {
            if line.to_ascii_uppercase().starts_with("* SEARCH") {
                uids.extend(
                    line.split_whitespace()
                        .skip(2) // skip "* SEARCH"
                        .filter_map(|s| s.parse::<u32>().ok()),
                );
            }
        }
        Ok(uids)
    }

    /// Fetch the full message by UID without setting `\Seen`.
    ///
    /// Returns `None` when the server has no such message (expunged) or
    /// the message is larger than [`MAX_LITERAL`].
    pub async fn uid_fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ChannelError> {
        let tag = self
            .send_command(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))
            .await?;

        let mut body = None;
        loop {
            let line = self.read_line().await?;

            if is_tagged(&line, &tag) {
                check_ok(&tag, &line, "FETCH")?;
                break;
            }

            // * N FETCH (UID nnn BODY[] {size}
            if line.starts_with("* ") && line.to_ascii_uppercase().contains("FETCH") {
                if let Some(size) = literal_size(&line) {
                    if size > self.max_literal {
                        warn!(uid, size, "message exceeds size limit, skipping");
                        self.discard(size).await?;
                        continue;
                    }
                    body = Some(self.read_exact(size).await?);
                    // Rest of the FETCH response after the literal, usually ")"
                    let _closing = self.read_line().await?;
                }
            }
        }
        Ok(body)
    }

    pub async fn logout(&mut self) -> Result<(), ChannelError> {
        let tag = self.send_command("LOGOUT").await?;
        // Server sends * BYE before the tagged OK
        self.read_response(&tag).await.map(|_| ())
    }
}

// ─────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────

fn is_tagged(line: &str, tag: &str) -> bool {
    line.strip_prefix(tag).is_some_and(|rest| rest.starts_with(' '))
}

fn check_ok(tag: &str, status: &str, what: &str) -> Result<(), ChannelError> {
    let rest = status.get(tag.len()..).unwrap_or_default().trim_start();
    if rest.to_ascii_uppercase().starts_with("OK") {
        Ok(())
    } else {
        Err(ChannelError::Protocol(format!("IMAP {what} failed: {rest}")))
    }
}

fn into_auth(e: ChannelError) -> ChannelError {
    match e {
        ChannelError::Protocol(msg) => ChannelError::Auth(msg),
        other => other,
    }
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `[KEY n]` response code value; `upper` must be uppercased.
fn bracket_value(upper: &str, key: &str) -> Option<u32> {
    let start = upper.find(&format!("[{key} "))? + key.len() + 2;
    let rest = &upper[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

/// Trailing `{N}` literal marker.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    let start = trimmed.rfind('{')?;
    trimmed[start + 1..trimmed.len() - 1].parse().ok()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One scripted exchange: expected command keyword and the reply,
    /// where `{tag}` is replaced with the client's tag.
    pub(crate) type Step = (&'static str, String);

    /// Single-connection fake IMAP server. Returns the port and a handle
    /// yielding every command line received.
    pub(crate) async fn fake_imap(steps: Vec<Step>) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read, mut write) = tokio::io::split(sock);
            let mut reader = tokio::io::BufReader::new(read);
            write.write_all(b"* OK fake IMAP ready\r\n").await.unwrap();

            let mut received = Vec::new();
            let mut tag = String::new();
            for (expect, reply) in steps {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                // continuation replies carry no tag
                if let Some(t) = line.split_whitespace().next() {
                    tag = t.to_string();
                }
                assert!(
                    line.to_ascii_uppercase().contains(expect),
                    "expected {expect}, got {line}"
                );
                received.push(line);
                write
                    .write_all(reply.replace("{tag}", &tag).as_bytes())
                    .await
                    .unwrap();
            }
            received
        });

        (port, handle)
    }

    pub(crate) fn local_config(port: u16) -> ImapConfig {
        ImapConfig {
            host: "127.0.0.1".into(),
            port,
            username: "support@acme.io".into(),
            password: "p\"ss".into(),
            mailbox: "INBOX".into(),
            tls_type: TlsType::None,
            ..Default::default()
        }
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_bracket_value() {
        let line = "* OK [UIDVALIDITY 3857529045] UIDs valid";
        assert_eq!(bracket_value(line, "UIDVALIDITY"), Some(3857529045));
        assert_eq!(bracket_value(line, "UIDNEXT"), None);
    }

    #[test]
    fn test_literal_size() {
        assert_eq!(literal_size("* 1 FETCH (UID 7 BODY[] {342}"), Some(342));
        assert_eq!(literal_size("* 1 FETCH (UID 7 FLAGS (\\Seen))"), None);
    }

    #[test]
    fn test_tag_matching() {
        assert!(is_tagged("A0001 OK done", "A0001"));
        assert!(!is_tagged("A00010 OK done", "A0001"));
        assert!(check_ok("A0001", "A0001 NO [AUTHENTICATIONFAILED] bad", "LOGIN").is_err());
    }

    #[tokio::test]
    async fn test_session_against_fake_server() {
        let message = "From: alice@example.com\r\nSubject: Help\r\n\r\nHi\r\n";
        let (port, server) = fake_imap(vec![
            ("LOGIN", "{tag} OK logged in\r\n".into()),
            (
                "EXAMINE",
                "* 2 EXISTS\r\n* OK [UIDVALIDITY 42] ok\r\n* OK [UIDNEXT 12] next\r\n{tag} OK [READ-ONLY] done\r\n"
                    .into(),
            ),
            ("UID SEARCH", "* SEARCH 10 11\r\n{tag} OK search done\r\n".into()),
            (
                "UID FETCH",
                format!(
                    "* 1 FETCH (UID 10 BODY[] {{{}}}\r\n{message})\r\n{{tag}} OK fetched\r\n",
                    message.len()
                ),
            ),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let cfg = local_config(port);
        let mut client = ImapClient::connect(&cfg).await.unwrap();
        client.login(&cfg.username, &cfg.password).await.unwrap();

        let status = client.examine("INBOX").await.unwrap();
        assert_eq!(
            status,
            MailboxStatus {
                exists: 2,
                uid_validity: Some(42),
                uid_next: Some(12)
            }
        );

        assert_eq!(client.uid_search("SINCE 01-Jan-2026").await.unwrap(), vec![10, 11]);
        let body = client.uid_fetch(10).await.unwrap().unwrap();
        assert_eq!(body, message.as_bytes());
        client.logout().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received[0], r#"A0001 LOGIN "support@acme.io" "p\"ss""#);
        assert!(received[3].ends_with("UID FETCH 10 (UID BODY.PEEK[])"));
    }

    #[tokio::test]
    async fn test_oversized_literal_is_skipped_without_buffering() {
        let message = "From: alice@example.com\r\nSubject: Huge\r\n\r\n0123456789abcdef\r\n";
        let (port, server) = fake_imap(vec![
            ("LOGIN", "{tag} OK logged in\r\n".into()),
            (
                "UID FETCH",
                format!(
                    "* 1 FETCH (UID 10 BODY[] {{{}}}\r\n{message})\r\n{{tag}} OK fetched\r\n",
                    message.len()
                ),
            ),
            ("LOGOUT", "* BYE\r\n{tag} OK bye\r\n".into()),
        ])
        .await;

        let cfg = local_config(port);
        let mut client = ImapClient::connect(&cfg).await.unwrap();
        client.max_literal = 16;
        client.login(&cfg.username, &cfg.password).await.unwrap();

        assert_eq!(client.uid_fetch(10).await.unwrap(), None);
        // the session is still in step with the server
        client.logout().await.unwrap();
        assert_eq!(server.await.unwrap().len(), 3);

        assert!(matches!(
            client.read_exact(17).await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_login_rejected_is_auth_error() {
        let (port, _server) = fake_imap(vec![(
            "LOGIN",
            "{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n".into(),
        )])
        .await;

        let mut client = ImapClient::connect(&local_config(port)).await.unwrap();
        let err = client.login("u", "p").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_xoauth2_error_challenge() {
        let (port, server) = fake_imap(vec![
            (
                "AUTHENTICATE XOAUTH2",
                "+ eyJzdGF0dXMiOiI0MDEifQ==\r\n".into(),
            ),
            ("", "{tag} NO SASL authentication failed\r\n".into()),
        ])
        .await;

        let mut client = ImapClient::connect(&local_config(port)).await.unwrap();
        let err = client
            .authenticate_xoauth2("support@acme.io", "expired")
            .await
            .unwrap_err();
        assert!(err.is_auth());
        server.await.unwrap();
    }
}
