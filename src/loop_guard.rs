//! Loop guard: keeps the bridge from echoing its own writes.
//!
//! Every update the inbound side writes carries [`SYSTEM_ORIGIN_MARKER`];
//! the outbound side refuses to email anything that carries it. Both sides
//! must agree on the marker, so it only lives here.

use crate::pipeline::types::{AuthorKind, Ticket, TicketUpdate};

/// Hidden marker on ticket updates relayed from email.
pub const SYSTEM_ORIGIN_MARKER: &str = "<!-- source:email -->";

/// Whether `update` should be emailed to the customer.
///
/// All three must hold: the ticket carries the routing label, a human wrote
/// the update, and the text is not marked as relayed from email.
pub fn is_forwardable(update: &TicketUpdate, ticket: &Ticket, routing_label: &str) -> bool {
    ticket.has_label(routing_label)
        && update.author_kind == AuthorKind::Human
        && !has_system_origin(&update.text)
}

/// Append the hidden marker to text the bridge writes into the tracker.
pub fn mark_system_origin(text: &str) -> String {
    if has_system_origin(text) {
        return text.to_string();
    }
    if text.trim().is_empty() {
        SYSTEM_ORIGIN_MARKER.to_string()
    } else {
        format!("{}\n\n{SYSTEM_ORIGIN_MARKER}", text.trim_end())
    }
}

pub fn has_system_origin(text: &str) -> bool {
    text.contains(SYSTEM_ORIGIN_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const LABEL: &str = "helpdesk";

    fn ticket(labelled: bool) -> Ticket {
        Ticket {
            number: 42,
            title: "[GH-0042] Login".into(),
            description: String::new(),
            labels: if labelled {
                vec![LABEL.into(), "from:alice@example.com".into()]
            } else {
                vec!["bug".into()]
            },
            is_open: true,
            updated_at: Utc::now(),
        }
    }

    fn update(kind: AuthorKind, marked: bool) -> TicketUpdate {
        let text = "We reset your password.";
        TicketUpdate {
            id: 1,
            author: "support".into(),
            author_kind: kind,
            text: if marked {
                mark_system_origin(text)
            } else {
                text.into()
            },
        }
    }

    #[test]
    fn forwardable_only_when_all_three_hold() {
        for labelled in [true, false] {
            for kind in [AuthorKind::Human, AuthorKind::System] {
                for marked in [true, false] {
                    let expected = labelled && kind == AuthorKind::Human && !marked;
                    assert_eq!(
                        is_forwardable(&update(kind, marked), &ticket(labelled), LABEL),
                        expected,
                        "labelled={labelled} kind={kind:?} marked={marked}"
                    );
                }
            }
        }
    }

    #[test]
    fn mark_appends_after_blank_line() {
        assert_eq!(
            mark_system_origin("Hello\n"),
            "Hello\n\n<!-- source:email -->"
        );
    }

    #[test]
    fn mark_is_idempotent() {
        let once = mark_system_origin("Hello");
        assert_eq!(mark_system_origin(&once), once);
    }

    #[test]
    fn mark_empty_text() {
        assert_eq!(mark_system_origin(""), SYSTEM_ORIGIN_MARKER);
        assert!(has_system_origin(&mark_system_origin("")));
    }
}
