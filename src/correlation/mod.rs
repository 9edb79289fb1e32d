//! Correlation records: the only state the bridge persists.
//!
//! A record lives inside the ticket description as an HTML comment, so the
//! tracker renders it invisibly:
//!
//! ```text
//! <!-- HELPDESK_METADATA
//! thread_id: <first-message@mail.example>
//! from: alice@example.com
//! message_ids: ["<first-message@mail.example>", "<reply@github-helpdesk>"]
//! -->
//! ```
//!
//! Values that would end the comment early, span lines, or start with a
//! quote are written as JSON strings with `>` escaped after `--`, so no
//! field can contain the block terminator.
//!
//! This layout is a stored format: changing it breaks every existing ticket.
//! Reconcilers only go through [`decode`] and [`embed`], so the storage
//! strategy can change without touching them.

pub mod token;

pub use token::{TokenFormat, normalize_subject};

use crate::error::CodecError;

const BLOCK_START: &str = "<!-- HELPDESK_METADATA";
const BLOCK_END: &str = "-->";
const ESCAPED_END: &str = "--\\u003e";

/// Thread-linking metadata for one ticket.
///
/// Fields are single-line values taken from mail headers. `message_ids` is
/// append-only, oldest first; the last entry is what the next reply chains to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    /// Conversation identifier: the `Message-ID` of the email that opened the ticket.
    pub thread_id: String,
    /// Originating sender address; outbound replies go here.
    pub sender: String,
    pub message_ids: Vec<String>,
}

impl CorrelationRecord {
    /// Record for a ticket opened by `message_id`.
    pub fn start(message_id: &str, sender: &str) -> Self {
        Self {
            thread_id: message_id.to_string(),
            sender: sender.to_string(),
            message_ids: vec![message_id.to_string()],
        }
    }

    /// Most recent identifier, used for `In-Reply-To`.
    pub fn latest(&self) -> Option<&str> {
        self.message_ids.last().map(String::as_str)
    }

    /// Whether `id` belongs to this conversation.
    pub fn knows(&self, id: &str) -> bool {
        !id.is_empty() && (self.thread_id == id || self.message_ids.iter().any(|m| m == id))
    }

    /// Append `id` to the history, dropping the oldest entries beyond `cap`.
    ///
    /// Returns `false` when `id` is already recorded (nothing changes).
    /// The newest entry always survives, even with a cap of zero.
    pub fn push(&mut self, id: &str, cap: Option<usize>) -> bool {
        if self.message_ids.iter().any(|m| m == id) {
            return false;
        }
        self.message_ids.push(id.to_string());
        if let Some(cap) = cap {
            let keep = cap.max(1);
            if self.message_ids.len() > keep {
                let excess = self.message_ids.len() - keep;
                self.message_ids.drain(..excess);
            }
        }
        true
    }
}

/// Serialize a record into its description block.
pub fn encode(record: &CorrelationRecord) -> String {
    let ids = record
        .message_ids
        .iter()
        .map(String::as_str)
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{BLOCK_START}\nthread_id: {}\nfrom: {}\nmessage_ids: [{ids}]\n{BLOCK_END}",
        encode_field(&record.thread_id),
        encode_field(&record.sender)
    )
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace(BLOCK_END, ESCAPED_END)
}

fn encode_field(value: &str) -> String {
    let plain = !value.contains(BLOCK_END)
        && !value.starts_with('"')
        && !value.contains(['\n', '\r'])
        && value.trim() == value;
    if plain { value.to_string() } else { quote(value) }
}

fn decode_field(value: &str) -> String {
    if value.starts_with('"')
        && let Ok(unquoted) = serde_json::from_str::<String>(value)
    {
        return unquoted;
    }
    value.to_string()
}

/// Find and parse the record block in a description.
///
/// A description without a block is `NotFound`, never an error of its own.
pub fn decode(description: &str) -> Result<CorrelationRecord, CodecError> {
    let (start, end) = locate(description).ok_or(CodecError::NotFound)?;
    let inner = &description[start + BLOCK_START.len()..end];
    if end == description.len() {
        return Err(malformed("unterminated block"));
    }

    let mut thread_id = None;
    let mut sender = None;
    let mut message_ids = Vec::new();

    for line in inner.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "thread_id" if !value.is_empty() => thread_id = Some(decode_field(value)),
            "from" if !value.is_empty() => sender = Some(decode_field(value)),
            "message_ids" => {
                message_ids = serde_json::from_str::<Vec<String>>(value)
                    .map_err(|e| malformed(format!("message_ids: {e}")))?;
            }
            _ => {}
        }
    }

    Ok(CorrelationRecord {
        thread_id: thread_id.ok_or_else(|| malformed("missing thread_id"))?,
        sender: sender.ok_or_else(|| malformed("missing from"))?,
        message_ids,
    })
}

/// Write `record` into `description`, replacing an existing block in place
/// or appending one after the human-visible text.
pub fn embed(description: &str, record: &CorrelationRecord) -> String {
    let block = encode(record);
    match locate(description) {
        Some((start, end)) => {
            let tail = if end < description.len() {
                &description[end + BLOCK_END.len()..]
            } else {
                ""
            };
            format!("{}{block}{tail}", &description[..start])
        }
        None if description.trim().is_empty() => block,
        None => format!("{}\n\n{block}", description.trim_end()),
    }
}

/// Byte range of the block: `(start of BLOCK_START, start of BLOCK_END)`.
/// An unterminated block ends at the end of the text.
fn locate(description: &str) -> Option<(usize, usize)> {
    let start = description.find(BLOCK_START)?;
    let body_from = start + BLOCK_START.len();
    let end = description[body_from..]
        .find(BLOCK_END)
        .map_or(description.len(), |offset| body_from + offset);
    Some((start, end))
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedRecord {
        reason: reason.into(),
    }
}
