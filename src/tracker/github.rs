//! GitHub Issues as the ticket tracker: REST for issues, comments and
//! repository contents, GraphQL for adding new issues to a project board.
//!
//! No retries happen here: every call maps its failure onto
//! [`TransportError`] and the reconcilers decide whether to retry.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{optional, required};
use crate::error::{ConfigError, Error, TransportError};
use crate::pipeline::types::{AuthorKind, Ticket, TicketPatch, TicketUpdate, TicketUpdateEvent};
use crate::tracker::{AttachmentStore, TicketStore};

const SERVICE: &str = "github";
const DEFAULT_API_BASE: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest error body kept in a `TransportError`.
const ERROR_BODY_LIMIT: usize = 500;

// ── Configuration ───────────────────────────────────────────────────

/// GitHub connection settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub token: SecretString,
    /// `owner/repo`.
    pub repository: String,
    pub api_base: String,
    /// Projects (v2) node id new tickets are added to, if any.
    pub project_id: Option<String>,
    /// Logins treated as automation besides GitHub `Bot` accounts.
    pub system_logins: Vec<String>,
}

impl GithubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = required("GITHUB_TOKEN")?;
        let repository = required("GITHUB_REPOSITORY")?;
        validate_repository(&repository)?;
        let api_base = optional("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let project_id = optional("PROJECT_ID");
        let system_logins = optional("HELPDESK_SYSTEM_LOGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            token: SecretString::from(token),
            repository,
            api_base,
            project_id,
            system_logins,
        })
    }
}

fn validate_repository(raw: &str) -> Result<(), ConfigError> {
    let valid = raw
        .trim()
        .split_once('/')
        .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "GITHUB_REPOSITORY".into(),
            message: format!("'{raw}' is not in owner/repo form"),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct GithubUser {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubLabel {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubIssue {
    number: u64,
    #[serde(default)]
    node_id: String,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GithubLabel>,
    state: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    pull_request: Option<Value>,
}

impl From<GithubIssue> for Ticket {
    fn from(issue: GithubIssue) -> Self {
        Self {
            number: issue.number,
            title: issue.title,
            description: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            is_open: issue.state.eq_ignore_ascii_case("open"),
            updated_at: issue.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GithubComment {
    id: u64,
    body: Option<String>,
    user: GithubUser,
}

#[derive(Debug, Deserialize)]
struct CommentEvent {
    issue: GithubIssue,
    comment: GithubComment,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: ContentsFile,
}

#[derive(Debug, Deserialize)]
struct ContentsFile {
    download_url: Option<String>,
    html_url: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────

/// GitHub-backed [`TicketStore`] and [`AttachmentStore`].
#[derive(Debug, Clone)]
pub struct GithubTracker {
    http: reqwest::Client,
    api_base: String,
    graphql_url: String,
    repository: String,
    project_id: Option<String>,
}

impl GithubTracker {
    pub fn new(config: &GithubConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("helpdesk-bridge"));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        let mut auth = HeaderValue::from_str(&format!(
            "Bearer {}",
            config.token.expose_secret().trim()
        ))
        .map_err(|e| ConfigError::InvalidValue {
            key: "GITHUB_TOKEN".into(),
            message: e.to_string(),
        })?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GITHUB_API_URL".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let api_base = config.api_base.trim_end_matches('/').to_string();
        Ok(Self {
            graphql_url: graphql_url(&api_base),
            http,
            api_base,
            repository: config.repository.clone(),
            project_id: config.project_id.clone(),
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_base, self.repository)
    }

    fn issue_url(&self, number: u64) -> String {
        format!("{}/{number}", self.issues_url())
    }

    /// Send a request and map any non-success status onto a transport error.
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::transient(SERVICE, format!("{operation}: {e}")))?;
        check(operation, response).await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        self.send(operation, request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| TransportError::transient(SERVICE, format!("failed to decode {operation}: {e}")))
    }

    /// Add an issue to the configured Projects (v2) board.
    async fn add_to_project(&self, project_id: &str, node_id: &str) -> Result<(), TransportError> {
        let query = "mutation($projectId: ID!, $contentId: ID!) { \
                     addProjectV2ItemById(input: {projectId: $projectId, contentId: $contentId}) \
                     { item { id } } }";
        let payload = json!({
            "query": query,
            "variables": { "projectId": project_id, "contentId": node_id },
        });
        let result: Value = self
            .request_json("add to project", self.http.post(&self.graphql_url).json(&payload))
            .await?;
        if let Some(errors) = result.get("errors") {
            return Err(TransportError::PermanentValidation(format!(
                "GraphQL errors adding to project: {errors}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketStore for GithubTracker {
    async fn create(
        &self,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<u64, TransportError> {
        let payload = json!({ "title": title, "body": description, "labels": labels });
        let issue: GithubIssue = self
            .request_json("create issue", self.http.post(self.issues_url()).json(&payload))
            .await?;
        info!(ticket = issue.number, "Created GitHub issue");

        if let Some(project_id) = &self.project_id
            && let Err(e) = self.add_to_project(project_id, &issue.node_id).await
        {
            warn!(ticket = issue.number, error = %e, "Failed to add issue to project");
        }
        Ok(issue.number)
    }

    async fn get(&self, number: u64) -> Result<Option<Ticket>, TransportError> {
        let response = self
            .http
            .get(self.issue_url(number))
            .send()
            .await
            .map_err(|e| TransportError::transient(SERVICE, format!("get issue: {e}")))?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            debug!(ticket = number, "Issue not found");
            return Ok(None);
        }
        let issue: GithubIssue = check("get issue", response)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::transient(SERVICE, format!("failed to decode get issue: {e}")))?;
        if issue.pull_request.is_some() {
            return Ok(None);
        }
        Ok(Some(issue.into()))
    }

    async fn update(&self, number: u64, patch: &TicketPatch) -> Result<(), TransportError> {
        let mut payload = serde_json::Map::new();
        if let Some(title) = &patch.title {
            payload.insert("title".into(), json!(title));
        }
        if let Some(description) = &patch.description {
            payload.insert("body".into(), json!(description));
        }
        if payload.is_empty() {
            return Ok(());
        }
        self.send("update issue", self.http.patch(self.issue_url(number)).json(&payload))
            .await?;
        Ok(())
    }

    /// GitHub attributes every comment to the token's account, so
    /// `author_kind` has no wire representation here.
    async fn append_update(
        &self,
        number: u64,
        text: &str,
        _author_kind: AuthorKind,
    ) -> Result<u64, TransportError> {
        let payload = json!({ "body": text });
        let comment: GithubComment = self
            .request_json(
                "create comment",
                self.http
                    .post(format!("{}/comments", self.issue_url(number)))
                    .json(&payload),
            )
            .await?;
        Ok(comment.id)
    }

    async fn find_by_label(&self, label: &str) -> Result<Vec<Ticket>, TransportError> {
        let mut tickets = Vec::new();
        let mut page = 1_u32;
        loop {
            let (per_page, page_no) = (PAGE_SIZE.to_string(), page.to_string());
            let request = self.http.get(self.issues_url()).query(&[
                ("labels", label),
                ("state", "all"),
                ("per_page", per_page.as_str()),
                ("page", page_no.as_str()),
            ]);
            let chunk: Vec<GithubIssue> = self.request_json("list issues", request).await?;
            let chunk_len = chunk.len();
            tickets.extend(
                chunk
                    .into_iter()
                    .filter(|issue| issue.pull_request.is_none())
                    .map(Ticket::from),
            );
            if chunk_len < PAGE_SIZE {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(tickets)
    }

    async fn set_open(&self, number: u64, is_open: bool) -> Result<(), TransportError> {
        let state = if is_open { "open" } else { "closed" };
        self.send(
            "set issue state",
            self.http
                .patch(self.issue_url(number))
                .json(&json!({ "state": state })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for GithubTracker {
    /// Commit the file under `attachments/<ticket>/` and return its raw URL.
    async fn upload(
        &self,
        ticket: u64,
        filename: &str,
        data: &[u8],
    ) -> Result<String, TransportError> {
        let short_id = Uuid::new_v4().simple().to_string();
        let path = format!(
            "attachments/{ticket}/{}-{}",
            &short_id[..8],
            safe_filename(filename)
        );
        let payload = json!({
            "message": format!("Add attachment for ticket #{ticket}"),
            "content": BASE64.encode(data),
        });
        let response: ContentsResponse = self
            .request_json(
                "upload attachment",
                self.http
                    .put(format!("{}/repos/{}/contents/{path}", self.api_base, self.repository))
                    .json(&payload),
            )
            .await?;
        response
            .content
            .download_url
            .or(response.content.html_url)
            .ok_or_else(|| TransportError::transient(SERVICE, "upload response carried no URL"))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Pass a success response through; turn anything else into an error.
async fn check(operation: &str, response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(operation, status, &headers, &body, Utc::now()))
}

/// Map a failed GitHub response onto the transport error taxonomy.
///
/// 429, and 403 with an exhausted rate-limit budget, are rate limits;
/// 5xx and 401 are transient; any other 4xx is a validation failure.
pub(crate) fn classify_status(
    operation: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> TransportError {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");

    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
        return TransportError::RateLimited {
            service: SERVICE.into(),
            retry_after: parse_retry_after(headers, now),
        };
    }

    let detail = truncate(body, ERROR_BODY_LIMIT);
    let reason = format!("{operation} failed with status {}: {detail}", status.as_u16());
    if status.is_server_error() || status == StatusCode::UNAUTHORIZED {
        TransportError::transient(SERVICE, reason)
    } else {
        TransportError::PermanentValidation(reason)
    }
}

/// `Retry-After` seconds, or the wait until `x-ratelimit-reset`.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(secs) = header_value("retry-after") {
        return Some(Duration::from_secs(secs.max(0) as u64));
    }
    header_value("x-ratelimit-reset")
        .map(|reset| Duration::from_secs((reset - now.timestamp()).max(0) as u64))
}

fn graphql_url(api_base: &str) -> String {
    match api_base.strip_suffix("/v3") {
        Some(root) => format!("{root}/graphql"),
        None => format!("{api_base}/graphql"),
    }
}

fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Build a ticket update event from an `issue_comment` webhook payload.
///
/// `Bot` accounts and the configured `system_logins` count as automation.
pub fn parse_comment_event(
    payload: &str,
    system_logins: &[String],
) -> Result<TicketUpdateEvent, TransportError> {
    let event: CommentEvent = serde_json::from_str(payload).map_err(|e| {
        TransportError::PermanentValidation(format!("not an issue_comment event: {e}"))
    })?;

    let user = event.comment.user;
    let is_system = user.kind.eq_ignore_ascii_case("bot")
        || system_logins
            .iter()
            .any(|login| login.eq_ignore_ascii_case(&user.login));

    Ok(TicketUpdateEvent {
        ticket: event.issue.into(),
        update: TicketUpdate {
            id: event.comment.id,
            author: user.login,
            author_kind: if is_system {
                AuthorKind::System
            } else {
                AuthorKind::Human
            },
            text: event.comment.body.unwrap_or_default(),
        },
    })
}

/// Load an `issue_comment` webhook payload from disk (`GITHUB_EVENT_PATH`).
pub fn read_comment_event(
    path: &Path,
    system_logins: &[String],
) -> Result<TicketUpdateEvent, Error> {
    let payload = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    Ok(parse_comment_event(&payload, system_logins)?)
}
