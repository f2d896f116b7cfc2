//! Outgoing MIME assembly on top of lettre's message builder.

use lettre::message::header::ContentType as MimeType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;

use deskmail_core::bus::OutgoingMessage;
use deskmail_core::models::{Attachment, ContentType};
use deskmail_core::utils::extract_email_address;
use deskmail_core::ChannelError;

use super::parse::html_to_text;

/// A rendered message ready for DATA.
#[derive(Debug)]
pub struct Composed {
    pub message_id: String,
    pub bytes: Vec<u8>,
}

/// Generated Message-ID in the From address's domain.
pub fn generate_message_id(from: &str) -> String {
    let addr = extract_email_address(from);
    let domain = addr
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", uuid::Uuid::new_v4(), domain)
}

fn mailbox(addr: &str, field: &str) -> Result<Mailbox, ChannelError> {
    addr.trim()
        .parse()
        .map_err(|e| ChannelError::Config(format!("invalid {field} address '{addr}': {e}")))
}

fn attachment_part(att: &Attachment) -> Result<SinglePart, ChannelError> {
    let mime = MimeType::parse(&att.content_type)
        .or_else(|_| MimeType::parse("application/octet-stream"))
        .map_err(|e| ChannelError::Config(format!("attachment '{}': {e}", att.filename)))?;

    let part = match (&att.content_id, att.disposition.as_str()) {
        (Some(cid), "inline") => MimeAttachment::new_inline(cid.clone()),
        _ => MimeAttachment::new(att.filename.clone()),
    };
    Ok(part.body(att.content.clone(), mime))
}

/// Build the wire form of `msg`.
///
/// Bcc recipients go into the envelope only and never appear in headers.
pub fn compose(msg: &OutgoingMessage) -> Result<Composed, ChannelError> {
    let message_id = msg
        .message_id_header
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| generate_message_id(&msg.from));

    let mut builder = Message::builder()
        .from(mailbox(&msg.from, "from")?)
        .subject(msg.subject.clone())
        .message_id(Some(message_id.clone()));

    for to in &msg.to {
        builder = builder.to(mailbox(to, "to")?);
    }
    for cc in &msg.cc {
        builder = builder.cc(mailbox(cc, "cc")?);
    }
    if let Some(reply_to) = msg.reply_to.as_deref().filter(|r| !r.trim().is_empty()) {
        builder = builder.reply_to(mailbox(reply_to, "reply-to")?);
    }
    if let Some(parent) = &msg.in_reply_to {
        builder = builder.in_reply_to(parent.clone());
    }
    if !msg.references.is_empty() {
        builder = builder.references(msg.references.join(" "));
    }

    let alternative = (msg.content_type == ContentType::Html).then(|| {
        let text = if msg.text_content.trim().is_empty() {
            html_to_text(&msg.content)
        } else {
            msg.text_content.clone()
        };
        MultiPart::alternative_plain_html(text, msg.content.clone())
    });

    let built = if msg.attachments.is_empty() {
        match alternative {
            Some(alt) => builder.multipart(alt),
            None => builder.singlepart(SinglePart::plain(msg.content.clone())),
        }
    } else {
        let mut mixed = match alternative {
            Some(alt) => MultiPart::mixed().multipart(alt),
            None => MultiPart::mixed().singlepart(SinglePart::plain(msg.content.clone())),
        };
        for att in &msg.attachments {
            mixed = mixed.singlepart(attachment_part(att)?);
        }
        builder.multipart(mixed)
    };
    let email = built.map_err(|e| ChannelError::Config(format!("cannot build message: {e}")))?;

    Ok(Composed {
        message_id,
        bytes: email.formatted(),
    })
}
