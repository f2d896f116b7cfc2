//! RFC 5322 → [`RawMessage`].
//!
//! Threading headers, recipients, text/HTML bodies and attachments are
//! extracted; HTML-only mails get a derived plain-text body.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mailparse::{addrparse_header, DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use regex::Regex;

use deskmail_core::bus::{MessageHeaders, RawMessage};
use deskmail_core::models::Attachment;
use deskmail_core::ChannelError;

/// Parse a fetched message.
///
/// The Message-ID header is the dedup key; `fallback_source_id` is used
/// when the message has none.
pub fn parse_message(
    inbox_id: i64,
    raw: &[u8],
    fallback_source_id: impl FnOnce() -> String,
) -> Result<RawMessage, ChannelError> {
    let mail = mailparse::parse_mail(raw)
        .map_err(|e| ChannelError::Protocol(format!("unparseable message: {e}")))?;

    let headers = extract_headers(&mail);
    let source_id = headers
        .message_id
        .clone()
        .unwrap_or_else(fallback_source_id);

    let mut plain = Vec::new();
    let mut html = Vec::new();
    let mut attachments = Vec::new();
    collect_parts(&mail, &mut plain, &mut html, &mut attachments);

    let html_body = (!html.is_empty()).then(|| html.join("\n"));
    let text_body = if !plain.is_empty() {
        Some(plain.join("\n"))
    } else {
        html_body.as_deref().map(html_to_text)
    };

    let mut msg = RawMessage::new(inbox_id, source_id, headers);
    msg.text_body = text_body;
    msg.html_body = html_body;
    msg.attachments = attachments;
    Ok(msg)
}

fn extract_headers(mail: &ParsedMail) -> MessageHeaders {
    let h = &mail.headers;
    let first = |name: &str| h.get_first_value(name).map(|v| v.trim().to_string());

    let date = first("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    MessageHeaders {
        message_id: first("Message-ID").and_then(|v| message_ids(&v).into_iter().next()),
        in_reply_to: first("In-Reply-To").and_then(|v| message_ids(&v).into_iter().next()),
        references: first("References")
            .map(|v| message_ids(&v))
            .unwrap_or_default(),
        from: first("From").unwrap_or_default(),
        to: addresses(mail, "To"),
        cc: addresses(mail, "Cc"),
        delivered_to: h
            .get_all_values("Delivered-To")
            .iter()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect(),
        subject: first("Subject").unwrap_or_default(),
        date,
    }
}

/// `<id>` tokens in a Message-ID style header. A bare id without angle
/// brackets is accepted as-is.
fn message_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        ids.push(rest[start..start + len + 1].to_string());
        rest = &rest[start + len + 1..];
    }
    if ids.is_empty() {
        let bare = value.trim();
        if !bare.is_empty() && !bare.contains(char::is_whitespace) {
            ids.push(bare.to_string());
        }
    }
    ids
}

fn addresses(mail: &ParsedMail, name: &str) -> Vec<String> {
    let mut out = Vec::new();
    for header in mail.headers.get_all_headers(name) {
        let Ok(list) = addrparse_header(header) else {
            continue;
        };
        for addr in list.iter() {
            match addr {
                MailAddr::Single(info) => out.push(info.addr.to_lowercase()),
                MailAddr::Group(group) => {
                    out.extend(group.addrs.iter().map(|i| i.addr.to_lowercase()))
                }
            }
        }
    }
    out
}

/// Recursively collect text parts and attachments.
fn collect_parts(
    mail: &ParsedMail,
    plain: &mut Vec<String>,
    html: &mut Vec<String>,
    attachments: &mut Vec<Attachment>,
) {
    if !mail.subparts.is_empty() {
        for part in &mail.subparts {
            collect_parts(part, plain, html, attachments);
        }
        return;
    }

    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .cloned();
    let mimetype = mail.ctype.mimetype.to_lowercase();

    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (filename.is_some() && !mimetype.starts_with("text/"));

    if is_attachment {
        if let Ok(content) = mail.get_body_raw() {
            let content_id = mail
                .headers
                .get_first_value("Content-ID")
                .map(|v| v.trim().trim_matches(['<', '>']).to_string());
            attachments.push(Attachment {
                filename: filename.unwrap_or_else(|| "attachment".into()),
                content_type: mimetype,
                disposition: match disposition.disposition {
                    DispositionType::Inline => "inline".into(),
                    _ => "attachment".into(),
                },
                content_id,
                size: content.len(),
                content,
            });
        }
        return;
    }

    if let Ok(body) = mail.get_body() {
        if mimetype == "text/html" {
            html.push(body);
        } else if mimetype.starts_with("text/") {
            plain.push(body);
        }
    }
}

// ─────────────────────────────────────────────
// HTML → text
// ─────────────────────────────────────────────

static HTML_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?is)<(script|style)[^>]*>.*?</(script|style)>", ""),
        (r"(?i)<br\s*/?>", "\n"),
        (r"(?i)</(p|div|tr|li|h[1-6])>", "\n"),
        (r"<[^>]+>", ""),
        (r"\n{3,}", "\n\n"),
    ]
    .into_iter()
    .filter_map(|(pattern, rep)| Regex::new(pattern).ok().map(|re| (re, rep)))
    .collect()
});

/// Convert HTML to readable plain text.
pub fn html_to_text(html: &str) -> String {
    let mut text = html.to_string();
    for (re, rep) in HTML_RULES.iter() {
        text = re.replace_all(&text, *rep).into_owned();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
