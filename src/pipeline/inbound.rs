//! Inbound reconciler: turns unread emails into ticket updates.
//!
//! Each message is resolved through an ordered chain of tiers, falling
//! through whenever a tier finds nothing:
//! 1. Ticket-number token in the subject
//! 2. Conversation match against the records of labelled tickets
//! 3. Otherwise a new ticket is created
//!
//! A message is marked consumed only after its ticket effect is committed,
//! so a failure leaves it for the next run (at-least-once).

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channels::MailSource;
use crate::channels::email_types::sanitize_body;
use crate::config::ReconcileConfig;
use crate::correlation::{self, CorrelationRecord, normalize_subject};
use crate::error::{CodecError, Error, TransportError};
use crate::loop_guard::mark_system_origin;
use crate::pipeline::types::{
    Attachment, AuthorKind, BatchReport, InboundOutcome, MatchTier, Message, Ticket, TicketPatch,
};
use crate::retry::with_backoff;
use crate::tracker::{AttachmentStore, TicketStore};

/// Title used when a customer sends an email without a subject.
const EMPTY_SUBJECT_TITLE: &str = "(no subject)";

/// Inbound reconciler: one instance per run, no state kept between runs.
pub struct InboundReconciler {
    mail: Arc<dyn MailSource>,
    tickets: Arc<dyn TicketStore>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    config: ReconcileConfig,
}

impl InboundReconciler {
    pub fn new(
        mail: Arc<dyn MailSource>,
        tickets: Arc<dyn TicketStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            mail,
            tickets,
            attachments: None,
            config,
        }
    }

    /// Upload attachments here and link them from the relayed update.
    pub fn with_attachments(mut self, store: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(store);
        self
    }

    /// Process every unconsumed message once.
    ///
    /// Fails only when the mailbox itself cannot be read; per-message
    /// failures are tallied in the report and never stop the batch.
    pub async fn run(&self) -> Result<BatchReport, Error> {
        let retry = &self.config.retry;
        let messages = with_backoff(retry, "fetch unconsumed mail", move || {
            self.mail.fetch_unconsumed()
        })
        .await?;

        let mut report = BatchReport {
            fetched: messages.len(),
            ..BatchReport::default()
        };
        info!(count = messages.len(), "Processing unconsumed mail");

        for message in &messages {
            let outcome = match self.reconcile(message).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_permanent() => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Rejected message; left unconsumed"
                    );
                    report.rejected += 1;
                    continue;
                }
                Err(e) => {
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to reconcile message; will retry next run"
                    );
                    report.deferred += 1;
                    continue;
                }
            };

            let uid = message.uid.as_str();
            if let Err(e) =
                with_backoff(retry, "mark consumed", move || self.mail.mark_consumed(uid)).await
            {
                // Ticket effect is committed; the next run will see this
                // message again and may append it twice.
                error!(
                    message_id = %message.message_id,
                    ticket = outcome.ticket(),
                    error = %e,
                    "Failed to mark message consumed"
                );
                report.deferred += 1;
                continue;
            }

            match outcome {
                InboundOutcome::Created { .. } => report.created += 1,
                InboundOutcome::Appended { .. } => report.appended += 1,
            }
        }

        info!(
            fetched = report.fetched,
            processed = report.processed(),
            created = report.created,
            appended = report.appended,
            failed = report.failed(),
            deferred = report.deferred,
            rejected = report.rejected,
            "Inbound run complete"
        );
        Ok(report)
    }

    /// Apply one message to the ticket store. Does not mark it consumed.
    pub async fn reconcile(&self, message: &Message) -> Result<InboundOutcome, Error> {
        validate(message)?;
        info!(
            message_id = %message.message_id,
            sender = %message.sender,
            subject = %message.subject,
            "Reconciling inbound message"
        );

        match self.resolve(message).await? {
            Some((ticket, via)) => {
                let number = ticket.number;
                self.append(&ticket, message).await?;
                info!(ticket = number, via = via.label(), "Appended message to ticket");
                Ok(InboundOutcome::Appended {
                    ticket: number,
                    via,
                })
            }
            None => {
                let number = self.create(message).await?;
                info!(ticket = number, "Created ticket for message");
                Ok(InboundOutcome::Created { ticket: number })
            }
        }
    }

    /// Run the resolver tiers in priority order; `None` means "create".
    pub async fn resolve(&self, message: &Message) -> Result<Option<(Ticket, MatchTier)>, Error> {
        for tier in [MatchTier::Token, MatchTier::Conversation] {
            let found = match tier {
                MatchTier::Token => self.resolve_by_token(message).await?,
                MatchTier::Conversation => self.resolve_by_conversation(message).await?,
            };
            if let Some(ticket) = found {
                return Ok(Some((ticket, tier)));
            }
            debug!(message_id = %message.message_id, tier = tier.label(), "No match, falling through");
        }
        Ok(None)
    }

    /// Tier 1: the ticket named by the subject token, if it still exists
    /// and its record is readable.
    pub async fn resolve_by_token(&self, message: &Message) -> Result<Option<Ticket>, TransportError> {
        let Some(number) = self.config.tokens.extract(&message.subject) else {
            return Ok(None);
        };

        let ticket = with_backoff(&self.config.retry, "get ticket", move || {
            self.tickets.get(number)
        })
        .await?;

        let Some(ticket) = ticket else {
            warn!(ticket = number, "Subject token names a missing ticket");
            return Ok(None);
        };

        if let Err(CodecError::MalformedRecord { reason }) = correlation::decode(&ticket.description)
        {
            warn!(ticket = number, reason = %reason, "Ignoring token match on ticket with malformed record");
            return Ok(None);
        }
        Ok(Some(ticket))
    }

    /// Tier 2: a labelled ticket whose record knows this conversation.
    pub async fn resolve_by_conversation(
        &self,
        message: &Message,
    ) -> Result<Option<Ticket>, TransportError> {
        let label = self.config.routing_label.as_str();
        let candidates = with_backoff(&self.config.retry, "find tickets by label", move || {
            self.tickets.find_by_label(label)
        })
        .await?;
        debug!(count = candidates.len(), "Searching labelled tickets for conversation");

        Ok(match_conversation(&candidates, message, label).cloned())
    }

    /// Relay the message onto an existing ticket, extend its record and
    /// reopen it if closed.
    async fn append(&self, ticket: &Ticket, message: &Message) -> Result<(), Error> {
        let retry = &self.config.retry;
        let number = ticket.number;

        let body = self.relay_body(number, message).await;
        let text = mark_system_origin(&body);
        let text = text.as_str();
        with_backoff(retry, "append update", move || {
            self.tickets.append_update(number, text, AuthorKind::Human)
        })
        .await?;

        let (mut record, seeded) = match correlation::decode(&ticket.description) {
            Ok(record) => (Some(record), false),
            Err(CodecError::NotFound) => (
                Some(CorrelationRecord::start(&message.message_id, &message.sender)),
                true,
            ),
            Err(CodecError::MalformedRecord { reason }) => {
                warn!(ticket = number, reason = %reason, "Leaving malformed record untouched");
                (None, false)
            }
        };

        if let Some(record) = record.as_mut() {
            let grew = record.push(&message.message_id, self.config.history_cap);
            if grew || seeded {
                let patch = TicketPatch::description(correlation::embed(&ticket.description, record));
                let patch = &patch;
                with_backoff(retry, "update record", move || self.tickets.update(number, patch))
                    .await?;
            }
        }

        if !ticket.is_open {
            with_backoff(retry, "reopen ticket", move || self.tickets.set_open(number, true))
                .await?;
            info!(ticket = number, "Reopened closed ticket after customer reply");
        }
        Ok(())
    }

    /// Open a ticket for a message no existing ticket knows.
    ///
    /// The tracker assigns the number on creation, so the token goes into
    /// the title with a follow-up edit.
    async fn create(&self, message: &Message) -> Result<u64, Error> {
        let retry = &self.config.retry;
        let record = CorrelationRecord::start(&message.message_id, &message.sender);
        let body = sanitize_body(&message.body);
        let description = correlation::embed(&body, &record);

        let subject = normalize_subject(&message.subject);
        let title = if subject.is_empty() {
            EMPTY_SUBJECT_TITLE.to_string()
        } else {
            subject
        };
        let labels = vec![
            self.config.routing_label.clone(),
            format!("from:{}", message.sender),
        ];

        let (title_ref, description_ref, labels_ref) =
            (title.as_str(), description.as_str(), labels.as_slice());
        let number = with_backoff(retry, "create ticket", move || {
            self.tickets.create(title_ref, description_ref, labels_ref)
        })
        .await?;

        let mut patch = TicketPatch::title(self.config.tokens.apply(&message.subject, number));
        if !message.attachments.is_empty() {
            let body = self.relay_body(number, message).await;
            patch.description = Some(correlation::embed(&body, &record));
        }
        let patch = &patch;
        if let Err(e) =
            with_backoff(retry, "tag ticket title", move || self.tickets.update(number, patch)).await
        {
            // The record already links the conversation, so replies still
            // find this ticket without the token.
            warn!(ticket = number, error = %e, "Failed to add ticket token to title");
        }
        Ok(number)
    }

    /// Sanitized body plus the attachment listing, if any.
    async fn relay_body(&self, ticket: u64, message: &Message) -> String {
        let body = sanitize_body(&message.body);
        if message.attachments.is_empty() {
            return body;
        }
        let section = self.attachment_section(ticket, &message.attachments).await;
        if body.is_empty() {
            section
        } else {
            format!("{body}\n\n{section}")
        }
    }

    /// Upload attachments and render them as Markdown. Upload failures
    /// degrade to a plain listing; they never fail the message.
    async fn attachment_section(&self, ticket: u64, attachments: &[Attachment]) -> String {
        let mut images = Vec::new();
        let mut files = Vec::new();

        for attachment in attachments {
            let url = match &self.attachments {
                Some(store) => {
                    let (name, data) = (attachment.filename.as_str(), attachment.data.as_slice());
                    match with_backoff(&self.config.retry, "upload attachment", move || {
                        store.upload(ticket, name, data)
                    })
                    .await
                    {
                        Ok(url) => Some(url),
                        Err(e) => {
                            warn!(ticket, file = %attachment.filename, error = %e, "Attachment upload failed");
                            None
                        }
                    }
                }
                None => None,
            };

            let size_kb = attachment.data.len() as f64 / 1024.0;
            match url {
                Some(url) if attachment.is_image() => {
                    images.push(format!("![{}]({url})", attachment.filename));
                }
                Some(url) => files.push(format!("- [{}]({url}) ({size_kb:.1} KB)", attachment.filename)),
                None => files.push(format!(
                    "- `{}` ({size_kb:.1} KB) - not uploaded, see original email",
                    attachment.filename
                )),
            }
        }

        let mut sections = Vec::new();
        if !images.is_empty() {
            sections.push(format!("### Attached Images\n\n{}", images.join("\n")));
        }
        if !files.is_empty() {
            sections.push(format!("### Other Attachments\n\n{}", files.join("\n")));
        }
        sections.join("\n\n")
    }
}

/// Reject messages that can never be reconciled.
fn validate(message: &Message) -> Result<(), TransportError> {
    if message.sender.trim().is_empty() {
        return Err(TransportError::PermanentValidation(format!(
            "message {} has no sender address",
            message.message_id
        )));
    }
    if message.message_id.trim().is_empty() {
        return Err(TransportError::PermanentValidation(format!(
            "message uid {} has no Message-ID",
            message.uid
        )));
    }
    Ok(())
}

/// Pick the labelled ticket whose record knows this message's conversation.
///
/// A match means the message's own id or any ancestor id equals the
/// record's thread id or one of its recorded message ids. Tickets with
/// unreadable records are skipped. Several matches are a data anomaly:
/// the most recently updated ticket wins and the anomaly is logged.
pub fn match_conversation<'a>(
    tickets: &'a [Ticket],
    message: &Message,
    routing_label: &str,
) -> Option<&'a Ticket> {
    let matches: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| t.has_label(routing_label))
        .filter(|t| match correlation::decode(&t.description) {
            Ok(record) => message.thread_ids().any(|id| record.knows(id)),
            Err(_) => false,
        })
        .collect();

    if matches.len() > 1 {
        let numbers: Vec<u64> = matches.iter().map(|t| t.number).collect();
        warn!(
            target: "data_quality",
            message_id = %message.message_id,
            tickets = ?numbers,
            "Conversation matches several tickets; using the most recently updated"
        );
    }

    matches.into_iter().max_by_key(|t| t.updated_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn message(id: &str, ancestors: &[&str]) -> Message {
        Message {
            uid: "1".into(),
            message_id: id.into(),
            sender: "alice@example.com".into(),
            subject: "Re: Login".into(),
            body: "hi".into(),
            ancestors: ancestors.iter().map(|s| s.to_string()).collect(),
            attachments: vec![],
        }
    }

    fn ticket(number: u64, ids: &[&str], age_minutes: i64) -> Ticket {
        let record = CorrelationRecord {
            thread_id: ids.first().copied().unwrap_or("<t@x>").to_string(),
            sender: "alice@example.com".into(),
            message_ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        Ticket {
            number,
            title: format!("[GH-{number:04}] Login"),
            description: correlation::embed("Login fails", &record),
            labels: vec!["helpdesk".into()],
            is_open: true,
            updated_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn matches_by_ancestor_in_history() {
        let tickets = vec![ticket(3, &["<a@x>"], 5), ticket(7, &["<c0@x>", "<c1@x>"], 5)];
        let found = match_conversation(&tickets, &message("<c2@x>", &["<c1@x>"]), "helpdesk");
        assert_eq!(found.map(|t| t.number), Some(7));
    }

    #[test]
    fn matches_by_own_id() {
        let tickets = vec![ticket(7, &["<c1@x>"], 5)];
        let found = match_conversation(&tickets, &message("<c1@x>", &[]), "helpdesk");
        assert_eq!(found.map(|t| t.number), Some(7));
    }

    #[test]
    fn no_match_for_unrelated_thread() {
        let tickets = vec![ticket(7, &["<c1@x>"], 5)];
        assert!(match_conversation(&tickets, &message("<z@x>", &["<y@x>"]), "helpdesk").is_none());
    }

    #[test]
    fn most_recently_updated_wins_tie() {
        let tickets = vec![
            ticket(4, &["<c1@x>"], 30),
            ticket(9, &["<c1@x>"], 1),
            ticket(6, &["<c1@x>"], 10),
        ];
        let found = match_conversation(&tickets, &message("<c2@x>", &["<c1@x>"]), "helpdesk");
        assert_eq!(found.map(|t| t.number), Some(9));
    }

    #[test]
    fn skips_unlabelled_and_malformed() {
        let mut unlabelled = ticket(2, &["<c1@x>"], 1);
        unlabelled.labels.clear();
        let mut malformed = ticket(3, &["<c1@x>"], 1);
        malformed.description = "<!-- HELPDESK_METADATA\nfrom: a@b\n-->".into();
        let tickets = vec![unlabelled, malformed];
        assert!(match_conversation(&tickets, &message("<c2@x>", &["<c1@x>"]), "helpdesk").is_none());
    }

    #[test]
    fn validate_rejects_missing_sender() {
        let mut msg = message("<a@x>", &[]);
        msg.sender = "  ".into();
        assert!(matches!(
            validate(&msg),
            Err(TransportError::PermanentValidation(_))
        ));
        assert!(validate(&message("<a@x>", &[])).is_ok());
    }
}
