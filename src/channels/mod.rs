//! Mail collaborators: IMAP for inbound, SMTP via lettre for outbound.

pub mod email;
pub mod email_types;
mod imap;

pub use email::{ImapConfig, ImapMailbox, SmtpConfig, SmtpMailer};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::pipeline::types::Message;

/// Source of inbound messages.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Every message not yet marked consumed. Order is unspecified.
    async fn fetch_unconsumed(&self) -> Result<Vec<Message>, TransportError>;

    /// Mark a message handled so it is never fetched again.
    async fn mark_consumed(&self, uid: &str) -> Result<(), TransportError>;
}

/// A reply to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// `In-Reply-To`.
    pub reply_to_id: Option<String>,
    /// `References`, oldest first.
    pub reference_ids: Vec<String>,
}

/// Sink for outbound replies.
#[async_trait]
pub trait MailSink: Send + Sync {
    /// Send `mail` and return the `Message-ID` it went out with.
    async fn send(&self, mail: &OutgoingMail) -> Result<String, TransportError>;
}
