//! Helpdesk bridge: keeps an email inbox and a GitHub issue tracker in sync.
//!
//! Inbound mail becomes tickets or ticket updates; human replies on tickets
//! go back out as threaded email. The only state kept is a correlation
//! record embedded in each ticket's description.

pub mod channels;
pub mod config;
pub mod correlation;
pub mod error;
pub mod loop_guard;
pub mod pipeline;
pub mod retry;
pub mod tracker;
