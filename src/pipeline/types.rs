//! Shared types for the inbound and outbound reconcilers.

use chrono::{DateTime, Utc};

// ── Inbound message ─────────────────────────────────────────────────

/// An unread email as handed over by the mail source.
///
/// Immutable once fetched. `uid` is the mailbox-local handle used to mark
/// the message consumed; `message_id` is the RFC 5322 `Message-ID`.
#[derive(Debug, Clone)]
pub struct Message {
    /// Mailbox-local handle (IMAP UID).
    pub uid: String,
    /// `Message-ID` header, angle brackets included.
    pub message_id: String,
    /// Bare sender address.
    pub sender: String,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// `In-Reply-To` followed by `References`, deduplicated, in header order.
    pub ancestors: Vec<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Own identifier followed by every ancestor identifier.
    pub fn thread_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.message_id.as_str()).chain(self.ancestors.iter().map(String::as_str))
    }
}

/// A file attached to an inbound email.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        matches!(
            self.content_type.as_str(),
            "image/png" | "image/jpeg" | "image/jpg" | "image/gif" | "image/bmp" | "image/webp"
        )
    }
}

// ── Tickets ─────────────────────────────────────────────────────────

/// Who wrote a ticket update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorKind {
    Human,
    System,
}

/// A tracker ticket, as far as the reconcilers care about it.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub number: u64,
    pub title: String,
    /// Free-text description carrying the embedded correlation record.
    pub description: String,
    pub labels: Vec<String>,
    pub is_open: bool,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// One update entry (comment) on a ticket.
#[derive(Debug, Clone)]
pub struct TicketUpdate {
    pub id: u64,
    pub author: String,
    pub author_kind: AuthorKind,
    pub text: String,
}

/// A ticket update event handed to the outbound reconciler.
#[derive(Debug, Clone)]
pub struct TicketUpdateEvent {
    pub ticket: Ticket,
    pub update: TicketUpdate,
}

/// Partial edit of a ticket; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl TicketPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            description: None,
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        Self {
            title: None,
            description: Some(description.into()),
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// How an inbound message was matched to a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Token,
    Conversation,
}

impl MatchTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Conversation => "conversation",
        }
    }
}

/// Effect of reconciling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Appended { ticket: u64, via: MatchTier },
    Created { ticket: u64 },
}

impl InboundOutcome {
    pub fn ticket(&self) -> u64 {
        match self {
            Self::Appended { ticket, .. } | Self::Created { ticket } => *ticket,
        }
    }
}

/// Why an outbound update was not emailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotForwardable,
    NoRecord,
    MalformedRecord,
    TicketGone,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotForwardable => "not forwardable",
            Self::NoRecord => "no correlation record",
            Self::MalformedRecord => "malformed correlation record",
            Self::TicketGone => "ticket no longer exists",
        }
    }
}

/// Effect of reconciling one ticket update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    Sent { to: String, message_id: String },
    Skipped(SkipReason),
}

/// Tally of an inbound batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub created: usize,
    pub appended: usize,
    /// Items left unconsumed after a transient failure; a later run retries them.
    pub deferred: usize,
    /// Items rejected outright (e.g. no sender address).
    pub rejected: usize,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.created + self.appended
    }

    pub fn failed(&self) -> usize {
        self.deferred + self.rejected
    }

    /// A run with any failed item completes with a non-zero status.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}
