//! Email parsing: raw RFC 822 bytes to [`Message`], plus the body
//! sanitising applied before anything is written into a ticket.

use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::pipeline::types::{Attachment, Message};

/// Longest body relayed into a ticket, in characters.
pub const MAX_BODY_CHARS: usize = 50_000;
const TRUNCATION_NOTE: &str = "\n\n[Content truncated...]";

/// Parse a fetched email. `None` if the bytes are not a message at all.
///
/// Missing `Message-ID`s are replaced with one derived from the raw bytes,
/// so a redelivered message gets the same identifier on every run.
pub fn parse_message(uid: &str, raw: &[u8]) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(parse_email_address)
        .unwrap_or_default();

    let message_id = parsed
        .message_id()
        .map(normalize_message_id)
        .filter(|id| id.len() > 2)
        .unwrap_or_else(|| format!("<{}@generated>", Uuid::new_v5(&Uuid::NAMESPACE_OID, raw)));

    let mut ancestors: Vec<String> = Vec::new();
    for id in header_ids(parsed.in_reply_to())
        .into_iter()
        .chain(header_ids(parsed.references()))
    {
        if id != message_id && !ancestors.contains(&id) {
            ancestors.push(id);
        }
    }

    let body = match parsed.body_text(0) {
        Some(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => parsed
            .body_html(0)
            .map(|html| strip_html(html.as_ref()))
            .unwrap_or_default(),
    };

    let attachments = parsed
        .attachments()
        .enumerate()
        .filter_map(|(i, part)| {
            let part: &mail_parser::MessagePart = part;
            let data = part.contents();
            if data.is_empty() {
                return None;
            }
            let content_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into())
                .to_ascii_lowercase();
            Some(Attachment {
                filename: MimeHeaders::attachment_name(part)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("attachment-{}", i + 1)),
                content_type,
                data: data.to_vec(),
            })
        })
        .collect();

    Some(Message {
        uid: uid.to_string(),
        message_id,
        sender,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        body,
        ancestors,
        attachments,
    })
}

/// Message identifiers carried by an `In-Reply-To`/`References` header.
fn header_ids(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => id.split_whitespace().map(normalize_message_id).collect(),
        HeaderValue::TextList(ids) => ids.iter().map(|id| normalize_message_id(id)).collect(),
        _ => Vec::new(),
    }
}

/// `<id>` form, whether or not the parser kept the brackets.
pub fn normalize_message_id(id: &str) -> String {
    let bare = id.trim().trim_start_matches('<').trim_end_matches('>');
    format!("<{bare}>")
}

/// `John Doe <john@example.com>` → `john@example.com`.
pub fn parse_email_address(raw: &str) -> String {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.find('<'), raw.rfind('>'))
        && open < close
    {
        return raw[open + 1..close].trim().to_string();
    }
    raw.split_whitespace()
        .find(|token| token.contains('@'))
        .unwrap_or(raw)
        .to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Make an email body safe to embed in a ticket.
///
/// Angle brackets are escaped so a customer cannot forge a correlation
/// block or loop marker, and overly long bodies are cut short.
pub fn sanitize_body(body: &str) -> String {
    let escaped = body.replace('<', "&lt;").replace('>', "&gt;");
    match escaped.char_indices().nth(MAX_BODY_CHARS) {
        Some((idx, _)) => format!("{}{TRUNCATION_NOTE}", &escaped[..idx]),
        None => escaped,
    }
}
