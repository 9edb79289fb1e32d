//! Outbound reconciler: forwards human replies on tickets as threaded email.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channels::{MailSink, OutgoingMail};
use crate::config::ReconcileConfig;
use crate::correlation::{self, CorrelationRecord};
use crate::error::{CodecError, Error};
use crate::loop_guard::is_forwardable;
use crate::pipeline::types::{OutboundOutcome, SkipReason, Ticket, TicketPatch, TicketUpdateEvent};
use crate::retry::with_backoff;
use crate::tracker::TicketStore;

pub struct OutboundReconciler {
    tickets: Arc<dyn TicketStore>,
    mail: Arc<dyn MailSink>,
    config: ReconcileConfig,
}

impl OutboundReconciler {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        mail: Arc<dyn MailSink>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            tickets,
            mail,
            config,
        }
    }

    /// Decide whether `event` goes out as email, and send it if so.
    ///
    /// Skips are successful outcomes. Errors mean the send itself failed;
    /// a failure to persist the record after a confirmed send is only
    /// logged, since the email is already out.
    pub async fn reconcile(&self, event: &TicketUpdateEvent) -> Result<OutboundOutcome, Error> {
        let number = event.ticket.number;
        if !is_forwardable(&event.update, &event.ticket, &self.config.routing_label) {
            info!(ticket = number, update = event.update.id, "Update not forwardable, skipping");
            return Ok(OutboundOutcome::Skipped(SkipReason::NotForwardable));
        }

        let retry = &self.config.retry;

        // The event snapshot may predate a concurrent inbound append.
        let fresh = with_backoff(retry, "get ticket", move || self.tickets.get(number)).await?;
        let Some(ticket) = fresh else {
            warn!(ticket = number, "Ticket disappeared before reply could be sent");
            return Ok(OutboundOutcome::Skipped(SkipReason::TicketGone));
        };

        let mut record = match correlation::decode(&ticket.description) {
            Ok(record) => record,
            Err(CodecError::NotFound) => {
                warn!(ticket = number, "No correlation record; cannot route reply");
                return Ok(OutboundOutcome::Skipped(SkipReason::NoRecord));
            }
            Err(CodecError::MalformedRecord { reason }) => {
                warn!(ticket = number, reason = %reason, "Malformed correlation record; cannot route reply");
                return Ok(OutboundOutcome::Skipped(SkipReason::MalformedRecord));
            }
        };

        let mail = compose_reply(&ticket, &record, &event.update.text);
        let mail_ref = &mail;
        let message_id = with_backoff(retry, "send reply", move || self.mail.send(mail_ref)).await?;
        info!(
            ticket = number,
            to = %mail.to,
            message_id = %message_id,
            "Forwarded ticket update by email"
        );

        if record.push(&message_id, self.config.history_cap) {
            let patch = TicketPatch::description(correlation::embed(&ticket.description, &record));
            let patch = &patch;
            if let Err(e) =
                with_backoff(retry, "update record", move || self.tickets.update(number, patch)).await
            {
                // Next reply threads off the previous id instead; tolerated.
                error!(
                    ticket = number,
                    message_id = %message_id,
                    error = %e,
                    "Sent reply but failed to record its Message-ID"
                );
            }
        }

        Ok(OutboundOutcome::Sent {
            to: mail.to,
            message_id,
        })
    }
}

/// Threaded reply for `ticket` carrying `text`.
pub fn compose_reply(ticket: &Ticket, record: &CorrelationRecord, text: &str) -> OutgoingMail {
    OutgoingMail {
        to: record.sender.clone(),
        subject: format!("Re: {}", ticket.title),
        body: text.to_string(),
        reply_to_id: record.latest().map(str::to_string),
        reference_ids: record.message_ids.clone(),
    }
}
