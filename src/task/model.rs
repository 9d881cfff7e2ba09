#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Last stdout lines kept per running task for the status surface.
pub const TAIL_CAP: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Queued,
    Running,
    SessionFinished,
    Failed,
    NeedsClarification,
}

/// A task as received from the backend. Attachments are carried but never
/// consumed by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(rename = "id", alias = "taskId", default)]
    pub task_id: String,
    #[serde(rename = "displayNumber", alias = "display_number")]
    pub display_number: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(rename = "normalizedContent", alias = "content", default)]
    pub content: String,
    #[serde(rename = "gitRemote", alias = "repo_url", alias = "git_remote", default)]
    pub repo_url: String,
    #[serde(rename = "executionStatus", alias = "execution_status", default)]
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(rename = "originalTranscript", default)]
    pub original_transcript: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

impl Task {
    /// The instruction handed to the agent; falls back to the summary for
    /// tasks captured without long-form content.
    #[must_use]
    pub fn instruction(&self) -> &str {
        if self.content.trim().is_empty() {
            &self.summary
        } else {
            &self.content
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Starting,
    Executing,
    Stuck,
}

/// In-memory record owned by the runner from claim until cleanup. The
/// supervisor writes only the mutable output-tracking fields.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: String,
    pub display_number: u64,
    pub summary: String,
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub started_at: OffsetDateTime,
    pub agent_pid: Option<u32>,
    pub last_output_at: OffsetDateTime,
    pub tail: VecDeque<String>,
    pub phase: TaskPhase,
    pub phase_detail: Option<String>,
}

impl RunningTask {
    #[must_use]
    pub fn new(
        task: &Task,
        repo_path: PathBuf,
        worktree_path: PathBuf,
        branch: String,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            task_id: task.task_id.clone(),
            display_number: task.display_number,
            summary: task.summary.clone(),
            repo_path,
            worktree_path,
            branch,
            started_at: now,
            agent_pid: None,
            last_output_at: now,
            tail: VecDeque::with_capacity(TAIL_CAP),
            phase: TaskPhase::Starting,
            phase_detail: None,
        }
    }

    pub fn push_tail(&mut self, line: &str) {
        if self.tail.len() == TAIL_CAP {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_owned());
    }

    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        let secs = (OffsetDateTime::now_utc() - self.started_at).whole_seconds();
        u64::try_from(secs).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    SessionFinished,
    Failed,
    Timeout,
}

/// Completed-run record retained in memory for the day; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    pub display_number: u64,
    pub summary: String,
    pub completed_at: String,
    pub duration_seconds: u64,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    SessionFinished,
    Failed,
    DaemonShutdown,
}

/// Lifecycle event attached to a status update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: String,
    pub machine_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn now(kind: EventType, machine_name: &str) -> Self {
        Self {
            kind,
            timestamp: now_rfc3339(),
            machine_name: machine_name.to_owned(),
            summary: None,
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_task() -> Task {
        serde_json::from_value(serde_json::json!({
            "id": "t-001",
            "displayNumber": 427,
            "summary": "fix login",
            "normalizedContent": "fix the login flow",
            "gitRemote": "github.com/u/r",
            "executionStatus": "queued",
            "attachments": [{"kind": "screenshot", "url": "https://x/y.png"}]
        }))
        .unwrap()
    }

    #[test]
    fn deserializes_backend_wire_shape() {
        let task = sample_task();
        assert_eq!(task.display_number, 427);
        assert_eq!(task.repo_url, "github.com/u/r");
        assert_eq!(task.execution_status, ExecutionStatus::Queued);
        assert_eq!(task.instruction(), "fix the login flow");
        assert_eq!(task.attachments.len(), 1);
    }

    #[test]
    fn instruction_falls_back_to_summary() {
        let mut task = sample_task();
        task.content = "  ".to_owned();
        assert_eq!(task.instruction(), "fix login");
    }

    #[test]
    fn tail_ring_is_capped() {
        let task = sample_task();
        let mut record = RunningTask::new(
            &task,
            Path::new("/repo").to_path_buf(),
            Path::new("/wt").to_path_buf(),
            "push-427-abcd1234".to_owned(),
        );
        for i in 0..(TAIL_CAP + 5) {
            record.push_tail(&format!("line {i}"));
        }
        assert_eq!(record.tail.len(), TAIL_CAP);
        assert_eq!(record.tail.front().map(String::as_str), Some("line 5"));
        assert_eq!(record.tail.back().map(String::as_str), Some("line 24"));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = LifecycleEvent::now(EventType::DaemonShutdown, "buildbox")
            .with_summary("daemon stopping");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "daemon_shutdown");
        assert_eq!(v["machineName"], "buildbox");
        assert!(v.get("sessionId").is_none());
    }
}
