//! Email channel: IMAP mailbox for inbound, SMTP via lettre for outbound.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::email_types::parse_message;
use crate::channels::imap::ImapSession;
use crate::channels::{MailSink, MailSource, OutgoingMail};
use crate::config::{optional, parse_or, required};
use crate::error::{ConfigError, TransportError};
use crate::pipeline::types::Message;

/// Port on which SMTP servers expect TLS from the first byte.
const SMTPS_PORT: u16 = 465;
const DEFAULT_MESSAGE_ID_DOMAIN: &str = "github-helpdesk";

// ── Configuration ───────────────────────────────────────────────────

/// IMAP mailbox settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
}

impl ImapConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: required("IMAP_HOST")?,
            port: parse_or("IMAP_PORT", 993)?,
            username: required("IMAP_USER")?,
            password: SecretString::from(required("IMAP_PASSWORD")?),
            mailbox: optional("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".into()),
        })
    }
}

/// SMTP relay settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Right-hand side of generated `Message-ID`s.
    pub message_id_domain: String,
}

impl SmtpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let username = required("SMTP_USER")?;
        let from_address = optional("SMTP_FROM").unwrap_or_else(|| username.clone());
        Ok(Self {
            host: required("SMTP_HOST")?,
            port: parse_or("SMTP_PORT", 587)?,
            password: SecretString::from(required("SMTP_PASSWORD")?),
            username,
            from_address,
            message_id_domain: optional("HELPDESK_MESSAGE_ID_DOMAIN")
                .unwrap_or_else(|| DEFAULT_MESSAGE_ID_DOMAIN.into()),
        })
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// IMAP-backed [`MailSource`]. "Consumed" is the `\Seen` flag.
///
/// Each call opens its own session; runs are short and infrequent.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    fn open(config: &ImapConfig) -> Result<ImapSession, TransportError> {
        let mut session = ImapSession::connect(
            &config.host,
            config.port,
            &config.username,
            config.password.expose_secret(),
        )?;
        session.select(&config.mailbox)?;
        Ok(session)
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_unconsumed(&self) -> Result<Vec<Message>, TransportError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Message>, TransportError> {
            let mut session = Self::open(&config)?;
            let uids = session.search_unseen()?;
            debug!(count = uids.len(), mailbox = %config.mailbox, "Unseen messages");

            let mut messages = Vec::with_capacity(uids.len());
            for uid in &uids {
                let Some(raw) = session.fetch_raw(uid)? else {
                    warn!(uid = %uid, "FETCH returned no body");
                    continue;
                };
                match parse_message(uid, &raw) {
                    Some(message) => messages.push(message),
                    None => warn!(uid = %uid, "Skipping unparseable message"),
                }
            }
            session.logout();
            Ok(messages)
        })
        .await
        .map_err(|e| TransportError::transient("imap", format!("fetch task failed: {e}")))?
    }

    async fn mark_consumed(&self, uid: &str) -> Result<(), TransportError> {
        let config = self.config.clone();
        let uid = uid.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut session = Self::open(&config)?;
            session.mark_seen(&uid)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| TransportError::transient("imap", format!("store task failed: {e}")))?
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// SMTP-backed [`MailSink`].
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport, TransportError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let builder = if self.config.port == SMTPS_PORT {
            SmtpTransport::relay(&self.config.host)
        } else {
            SmtpTransport::starttls_relay(&self.config.host)
        }
        .map_err(|e| TransportError::transient("smtp", format!("SMTP relay error: {e}")))?;

        Ok(builder.port(self.config.port).credentials(creds).build())
    }
}

/// Build the lettre message for `mail` with the given `Message-ID`.
pub(crate) fn build_message(
    from: &str,
    mail: &OutgoingMail,
    message_id: &str,
) -> Result<lettre::Message, TransportError> {
    let mut builder = lettre::Message::builder()
        .from(from.parse().map_err(|e| {
            TransportError::PermanentValidation(format!("Invalid from address '{from}': {e}"))
        })?)
        .to(mail.to.parse().map_err(|e| {
            TransportError::PermanentValidation(format!("Invalid to address '{}': {e}", mail.to))
        })?)
        .subject(mail.subject.as_str())
        .message_id(Some(message_id.to_string()));

    if let Some(reply_to) = &mail.reply_to_id {
        builder = builder.in_reply_to(reply_to.clone());
    }
    if !mail.reference_ids.is_empty() {
        builder = builder.references(mail.reference_ids.join(" "));
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|e| TransportError::PermanentValidation(format!("Failed to build email: {e}")))
}

/// Fresh `<uuid@domain>` identifier.
pub(crate) fn generate_message_id(domain: &str) -> String {
    format!("<{}@{domain}>", Uuid::new_v4())
}

#[async_trait]
impl MailSink for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, TransportError> {
        let message_id = generate_message_id(&self.config.message_id_domain);
        let email = build_message(&self.config.from_address, mail, &message_id)?;
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| TransportError::transient("smtp", format!("send task failed: {e}")))?
            .map_err(|e| {
                if e.is_permanent() {
                    TransportError::PermanentValidation(format!("SMTP rejected message: {e}"))
                } else {
                    TransportError::transient("smtp", format!("SMTP send failed: {e}"))
                }
            })?;

        info!(to = %mail.to, message_id = %message_id, "Email sent");
        Ok(message_id)
    }
}

#[cfg(test)]
#[path = "email_tests.rs"]
mod tests;
