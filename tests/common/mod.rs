//! In-memory fakes of the collaborator traits, recording every call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use helpdesk_bridge::channels::{MailSink, MailSource, OutgoingMail};
use helpdesk_bridge::config::ReconcileConfig;
use helpdesk_bridge::correlation::{self, CorrelationRecord};
use helpdesk_bridge::error::TransportError;
use helpdesk_bridge::pipeline::types::{AuthorKind, Message, Ticket, TicketPatch};
use helpdesk_bridge::retry::RetryPolicy;
use helpdesk_bridge::tracker::{AttachmentStore, TicketStore};

pub const LABEL: &str = "helpdesk";
pub const SENDER: &str = "alice@example.com";

/// Reconcile settings with instant retries.
pub fn config() -> ReconcileConfig {
    let mut config = ReconcileConfig::new(LABEL, "GH").unwrap();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    config
}

pub fn message(uid: &str, id: &str, subject: &str, ancestors: &[&str]) -> Message {
    Message {
        uid: uid.into(),
        message_id: id.into(),
        sender: SENDER.into(),
        subject: subject.into(),
        body: format!("body of {id}"),
        ancestors: ancestors.iter().map(|s| s.to_string()).collect(),
        attachments: vec![],
    }
}

pub fn record(ids: &[&str]) -> CorrelationRecord {
    CorrelationRecord {
        thread_id: ids[0].to_string(),
        sender: SENDER.into(),
        message_ids: ids.iter().map(|s| s.to_string()).collect(),
    }
}

/// Open, labelled ticket carrying `record`.
pub fn ticket(number: u64, record: &CorrelationRecord) -> Ticket {
    Ticket {
        number,
        title: format!("[GH-{number:04}] Login fails"),
        description: correlation::embed("Login fails", record),
        labels: vec![LABEL.into(), format!("from:{SENDER}")],
        is_open: true,
        updated_at: Utc::now() - chrono::Duration::hours(1),
    }
}

fn transient(op: &str) -> TransportError {
    TransportError::transient("fake", format!("{op} unavailable"))
}

// ── Ticket store ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { title: String, labels: Vec<String> },
    Get(u64),
    Update(u64, TicketPatch),
    Append { number: u64, text: String, kind: AuthorKind },
    FindByLabel(String),
    SetOpen(u64, bool),
    Upload { ticket: u64, filename: String },
}

#[derive(Default)]
struct StoreState {
    tickets: BTreeMap<u64, Ticket>,
    next_number: u64,
    next_comment: u64,
    calls: Vec<Call>,
    /// Remaining injected failures per operation; `u32::MAX` = always.
    failures: HashMap<&'static str, u32>,
}

pub struct FakeTickets {
    state: Mutex<StoreState>,
}

impl FakeTickets {
    pub fn new() -> Self {
        Self::with_tickets(vec![])
    }

    pub fn with_tickets(tickets: Vec<Ticket>) -> Self {
        let next_number = tickets.iter().map(|t| t.number).max().unwrap_or(0) + 100;
        Self {
            state: Mutex::new(StoreState {
                tickets: tickets.into_iter().map(|t| (t.number, t)).collect(),
                next_number,
                next_comment: 1,
                ..StoreState::default()
            }),
        }
    }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail(&self, op: &'static str, times: u32) {
        self.state.lock().unwrap().failures.insert(op, times);
    }

    pub fn fail_always(&self, op: &'static str) {
        self.fail(op, u32::MAX);
    }

    pub fn ticket(&self, number: u64) -> Option<Ticket> {
        self.state.lock().unwrap().tickets.get(&number).cloned()
    }

    pub fn put(&self, ticket: Ticket) {
        self.state.lock().unwrap().tickets.insert(ticket.number, ticket);
    }

    pub fn remove(&self, number: u64) {
        self.state.lock().unwrap().tickets.remove(&number);
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.state.lock().unwrap().tickets.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { .. }))
            .count()
    }

    pub fn appends(&self) -> Vec<(u64, String, AuthorKind)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Append { number, text, kind } => Some((number, text, kind)),
                _ => None,
            })
            .collect()
    }

    /// Decoded record of a stored ticket.
    pub fn record_of(&self, number: u64) -> CorrelationRecord {
        let ticket = self.ticket(number).expect("ticket exists");
        correlation::decode(&ticket.description).expect("record decodes")
    }

    fn begin(&self, op: &'static str, call: Call) -> Result<std::sync::MutexGuard<'_, StoreState>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(left) = state.failures.get_mut(op)
            && *left > 0
        {
            if *left != u32::MAX {
                *left -= 1;
            }
            return Err(transient(op));
        }
        Ok(state)
    }
}

fn touch(ticket: &mut Ticket) {
    ticket.updated_at = Utc::now();
}

#[async_trait]
impl TicketStore for FakeTickets {
    async fn create(&self, title: &str, description: &str, labels: &[String]) -> Result<u64, TransportError> {
        let mut state = self.begin(
            "create",
            Call::Create {
                title: title.into(),
                labels: labels.to_vec(),
            },
        )?;
        let number = state.next_number;
        state.next_number += 1;
        state.tickets.insert(
            number,
            Ticket {
                number,
                title: title.into(),
                description: description.into(),
                labels: labels.to_vec(),
                is_open: true,
                updated_at: Utc::now(),
            },
        );
        Ok(number)
    }

    async fn get(&self, number: u64) -> Result<Option<Ticket>, TransportError> {
        let state = self.begin("get", Call::Get(number))?;
        Ok(state.tickets.get(&number).cloned())
    }

    async fn update(&self, number: u64, patch: &TicketPatch) -> Result<(), TransportError> {
        let mut state = self.begin("update", Call::Update(number, patch.clone()))?;
        let ticket = state
            .tickets
            .get_mut(&number)
            .ok_or_else(|| TransportError::PermanentValidation(format!("no ticket {number}")))?;
        if let Some(title) = &patch.title {
            ticket.title = title.clone();
        }
        if let Some(description) = &patch.description {
            ticket.description = description.clone();
        }
        touch(ticket);
        Ok(())
    }

    async fn append_update(&self, number: u64, text: &str, author_kind: AuthorKind) -> Result<u64, TransportError> {
        let mut state = self.begin(
            "append",
            Call::Append {
                number,
                text: text.into(),
                kind: author_kind,
            },
        )?;
        let id = state.next_comment;
        state.next_comment += 1;
        let ticket = state
            .tickets
            .get_mut(&number)
            .ok_or_else(|| TransportError::PermanentValidation(format!("no ticket {number}")))?;
        touch(ticket);
        Ok(id)
    }

    async fn find_by_label(&self, label: &str) -> Result<Vec<Ticket>, TransportError> {
        let state = self.begin("find_by_label", Call::FindByLabel(label.into()))?;
        Ok(state
            .tickets
            .values()
            .filter(|t| t.has_label(label))
            .cloned()
            .collect())
    }

    async fn set_open(&self, number: u64, is_open: bool) -> Result<(), TransportError> {
        let mut state = self.begin("set_open", Call::SetOpen(number, is_open))?;
        if let Some(ticket) = state.tickets.get_mut(&number) {
            ticket.is_open = is_open;
            touch(ticket);
        }
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for FakeTickets {
    async fn upload(&self, ticket: u64, filename: &str, _data: &[u8]) -> Result<String, TransportError> {
        self.begin(
            "upload",
            Call::Upload {
                ticket,
                filename: filename.into(),
            },
        )?;
        Ok(format!("https://files.test/attachments/{ticket}/{filename}"))
    }
}

// ── Mail ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<Vec<Message>>,
    consumed: Mutex<Vec<String>>,
    fetch_failures: Mutex<u32>,
    fail_mark: Mutex<bool>,
}

impl FakeMailbox {
    pub fn with(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    pub fn fail_fetch(&self, times: u32) {
        *self.fetch_failures.lock().unwrap() = times;
    }

    pub fn fail_mark(&self) {
        *self.fail_mark.lock().unwrap() = true;
    }

    pub fn consumed(&self) -> Vec<String> {
        self.consumed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSource for FakeMailbox {
    async fn fetch_unconsumed(&self) -> Result<Vec<Message>, TransportError> {
        {
            let mut left = self.fetch_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(transient("fetch"));
            }
        }
        let consumed = self.consumed();
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !consumed.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn mark_consumed(&self, uid: &str) -> Result<(), TransportError> {
        if *self.fail_mark.lock().unwrap() {
            return Err(transient("mark"));
        }
        self.consumed.lock().unwrap().push(uid.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSink {
    sent: Mutex<Vec<OutgoingMail>>,
    failures: Mutex<u32>,
    permanent: Mutex<bool>,
}

impl FakeSink {
    pub fn fail(&self, times: u32) {
        *self.failures.lock().unwrap() = times;
    }

    pub fn reject(&self) {
        *self.permanent.lock().unwrap() = true;
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSink for FakeSink {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, TransportError> {
        if *self.permanent.lock().unwrap() {
            return Err(TransportError::PermanentValidation("recipient rejected".into()));
        }
        {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(transient("send"));
            }
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail.clone());
        Ok(format!("<sent-{}@github-helpdesk>", sent.len()))
    }
}

pub fn at(ts: &str) -> DateTime<Utc> {
    ts.parse().unwrap()
}
