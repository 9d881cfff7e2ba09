#![forbid(unsafe_code)]

pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::config::machine::MachineIdentity;
use crate::error::PushdError;
use crate::task::model::{ExecutionStatus, LifecycleEvent, Task};

const DEFAULT_BASE_URL: &str = "https://api.push.dev/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat headers attached to every poll. These are the daemon's only
/// "I'm alive" signal to the backend.
const HEADER_MACHINE_ID: &str = "x-push-machine-id";
const HEADER_MACHINE_NAME: &str = "x-push-machine-name";
const HEADER_PROJECTS: &str = "x-push-projects";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,

    #[error("authentication failed (401): check PUSH_API_KEY")]
    Auth,

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("backend rejected update for #{0}")]
    Rejected(u64),
}

impl BackendError {
    fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Status { status, .. } => retry::is_retryable_status(*status),
            Self::Transport(msg) => retry::is_transient_message(msg),
            Self::Auth | Self::Decode(_) | Self::Rejected(_) => false,
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimOutcome {
    pub claimed: bool,
    #[serde(rename = "claimedBy", default)]
    pub claimed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    todos: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    display_number: u64,
    status: &'a str,
    machine_id: &'a str,
    machine_name: &'a str,
    atomic: bool,
}

/// Status write for a task, with optional detail fields and lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub display_number: u64,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<LifecycleEvent>,
}

impl StatusReport {
    #[must_use]
    pub fn new(display_number: u64, status: ExecutionStatus) -> Self {
        Self {
            display_number,
            status,
            summary: None,
            error: None,
            session_id: None,
            pr_url: None,
            event: None,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_pr_url(mut self, pr_url: impl Into<String>) -> Self {
        self.pr_url = Some(pr_url.into());
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: LifecycleEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// Authenticated client for the Push cloud backend. Every call carries a
/// bearer token, a 30 s per-attempt deadline, and retry with backoff on the
/// closed transient failure set.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    machine: MachineIdentity,
}

impl BackendClient {
    pub fn new(settings: &Settings, machine: MachineIdentity) -> Result<Self, PushdError> {
        let api_key = settings.require_api_key()?.to_owned();
        let base_url = std::env::var("PUSH_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PushdError::Other(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            machine,
        })
    }

    #[must_use]
    pub fn machine(&self) -> &MachineIdentity {
        &self.machine
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Fetch queued tasks for this machine. The heartbeat headers advertise
    /// machine identity and the registered project set.
    pub async fn poll(&self, repo_urls: &[String]) -> Result<Vec<Task>, BackendError> {
        let projects = repo_urls.join(",");
        retry::with_retry("poll", || async {
            let resp = self
                .http
                .get(self.url("synced-todos"))
                .bearer_auth(&self.api_key)
                .query(&[
                    ("execution_status", "queued"),
                    ("machine_id", self.machine.machine_id.as_str()),
                ])
                .header(HEADER_MACHINE_ID, self.machine.machine_id.as_str())
                .header(HEADER_MACHINE_NAME, self.machine.machine_name.as_str())
                .header(HEADER_PROJECTS, projects.as_str())
                .send()
                .await
                .map_err(|e| BackendError::from_reqwest(&e))?;
            let resp = check_status(resp).await?;
            let body: PollResponse = resp
                .json()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))?;
            Ok(body.todos)
        })
        .await
    }

    /// Atomic claim: at most one machine per task receives `claimed: true`.
    pub async fn claim(&self, display_number: u64) -> Result<ClaimOutcome, BackendError> {
        let request = ClaimRequest {
            display_number,
            status: "running",
            machine_id: &self.machine.machine_id,
            machine_name: &self.machine.machine_name,
            atomic: true,
        };
        retry::with_retry("claim", || async {
            let resp = self
                .http
                .patch(self.url("claim-task"))
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| BackendError::from_reqwest(&e))?;
            let resp = check_status(resp).await?;
            resp.json()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))
        })
        .await
    }

    pub async fn update_status(&self, report: &StatusReport) -> Result<(), BackendError> {
        retry::with_retry("update_status", || async {
            let resp = self
                .http
                .patch(self.url("update-task-execution"))
                .bearer_auth(&self.api_key)
                .json(report)
                .send()
                .await
                .map_err(|e| BackendError::from_reqwest(&e))?;
            let resp = check_status(resp).await?;
            let body: UpdateResponse = resp
                .json()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))?;
            if body.success {
                Ok(())
            } else {
                Err(BackendError::Rejected(report.display_number))
            }
        })
        .await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 401 {
        return Err(BackendError::Auth);
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::EventType;

    #[test]
    fn claim_request_wire_shape() {
        let request = ClaimRequest {
            display_number: 500,
            status: "running",
            machine_id: "host-a1b2c3d4",
            machine_name: "host",
            atomic: true,
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["displayNumber"], 500);
        assert_eq!(v["status"], "running");
        assert_eq!(v["machineId"], "host-a1b2c3d4");
        assert_eq!(v["machineName"], "host");
        assert_eq!(v["atomic"], true);
    }

    #[test]
    fn claim_outcome_parses_loser_shape() {
        let outcome: ClaimOutcome =
            serde_json::from_str(r#"{"claimed": false, "claimedBy": "machine-b"}"#).unwrap();
        assert!(!outcome.claimed);
        assert_eq!(outcome.claimed_by.as_deref(), Some("machine-b"));

        let outcome: ClaimOutcome = serde_json::from_str(r#"{"claimed": true}"#).unwrap();
        assert!(outcome.claimed);
        assert!(outcome.claimed_by.is_none());
    }

    #[test]
    fn status_report_omits_absent_fields() {
        let report = StatusReport::new(427, ExecutionStatus::SessionFinished)
            .with_session_id("S-1")
            .with_event(LifecycleEvent::now(EventType::SessionFinished, "host"));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["displayNumber"], 427);
        assert_eq!(v["status"], "session_finished");
        assert_eq!(v["sessionId"], "S-1");
        assert_eq!(v["event"]["type"], "session_finished");
        assert!(v.get("error").is_none());
        assert!(v.get("prUrl").is_none());
    }

    #[test]
    fn poll_response_tolerates_empty_and_missing_todos() {
        let body: PollResponse = serde_json::from_str(r#"{"todos": []}"#).unwrap();
        assert!(body.todos.is_empty());
        let body: PollResponse = serde_json::from_str("{}").unwrap();
        assert!(body.todos.is_empty());
    }
}
