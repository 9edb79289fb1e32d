//! Reconciliation pipeline.
//!
//! Inbound: `MailSource::fetch_unconsumed()` → resolve ticket (token,
//! conversation, create) → append or create → `MailSource::mark_consumed()`.
//!
//! Outbound: ticket update event → loop guard → fresh ticket read → threaded
//! reply via `MailSink` → record the sent `Message-ID`.

pub mod inbound;
pub mod outbound;
pub mod types;

pub use inbound::{InboundReconciler, match_conversation};
pub use outbound::{OutboundReconciler, compose_reply};
