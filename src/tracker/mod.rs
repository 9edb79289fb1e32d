//! Ticket tracker collaborators.
//!
//! The reconcilers only see these traits; [`github::GithubTracker`] is the
//! production implementation.

pub mod github;

pub use github::{GithubConfig, GithubTracker};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::pipeline::types::{AuthorKind, Ticket, TicketPatch};

/// Backend-agnostic ticket store.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Create a ticket; the tracker assigns and returns its number.
    async fn create(
        &self,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<u64, TransportError>;

    /// Look up a ticket. A missing or deleted ticket is `Ok(None)`.
    async fn get(&self, number: u64) -> Result<Option<Ticket>, TransportError>;

    /// Edit title and/or description.
    async fn update(&self, number: u64, patch: &TicketPatch) -> Result<(), TransportError>;

    /// Add an update entry (comment). Returns the new entry's id.
    async fn append_update(
        &self,
        number: u64,
        text: &str,
        author_kind: AuthorKind,
    ) -> Result<u64, TransportError>;

    /// Every ticket carrying `label`, open or closed.
    async fn find_by_label(&self, label: &str) -> Result<Vec<Ticket>, TransportError>;

    async fn set_open(&self, number: u64, is_open: bool) -> Result<(), TransportError>;
}

/// Where inbound attachments are kept so ticket updates can link to them.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Store `data` for `ticket` and return a URL the tracker can render.
    async fn upload(
        &self,
        ticket: u64,
        filename: &str,
        data: &[u8],
    ) -> Result<String, TransportError>;
}
