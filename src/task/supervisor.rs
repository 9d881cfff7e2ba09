#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use time::OffsetDateTime;
use tokio::io::AsyncBufReadExt as _;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::daemon::state::{self, SharedState};
use crate::task::model::{Task, TaskPhase};

/// Wall-clock limit for one agent run.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Grace between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Bound on accumulated stderr kept for failure reports.
const STDERR_KEEP: usize = 4096;

/// Phrases that indicate the agent is blocked on interactive input. Matched
/// case-insensitively against every stdout line; the first hit flips the
/// task phase to stuck, later hits are ignored.
const STUCK_PHRASES: &[&str] = &[
    "waiting for permission",
    "waiting for approval",
    "plan ready for approval",
    "press enter",
    "y/n",
    "yes/no",
    "confirm:",
    "do you want to proceed",
];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent_executable: String,
    pub allowed_tools: Option<String>,
    pub task_timeout: Duration,
    pub auto_commit: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_executable: "claude".to_owned(),
            allowed_tools: None,
            task_timeout: TASK_TIMEOUT,
            auto_commit: true,
        }
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone)]
pub enum RunEnd {
    Exited {
        code: i32,
        session_id: Option<String>,
        stderr_tail: String,
    },
    TimedOut {
        elapsed_secs: u64,
    },
    Shutdown,
}

/// Spawn the coding agent in the worktree and watch it to completion.
///
/// Stdout is consumed line-wise: each non-empty line bumps the task's
/// `last_output_at`, feeds the tail ring, and is scanned for stuck phrases
/// and an embedded session id. The run is bounded by the wall-clock timeout
/// and by daemon shutdown; both paths escalate SIGTERM to SIGKILL.
pub async fn supervise(
    cfg: &SupervisorConfig,
    state: &SharedState,
    task: &Task,
    worktree: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<RunEnd> {
    let display_number = task.display_number;
    let prompt = compose_prompt(task, cfg.auto_commit);

    let mut cmd = tokio::process::Command::new(&cfg.agent_executable);
    cmd.arg("--print")
        .arg("--dangerously-skip-permissions")
        .args(["-p", prompt.as_str()]);
    if let Some(tools) = &cfg.allowed_tools {
        cmd.args(["--allowed-tools", tools.as_str()]);
    }
    cmd.args(["--output-format", "json"])
        .current_dir(worktree)
        .env("PUSH_TASK_ID", &task.task_id)
        .env("PUSH_DISPLAY_NUMBER", display_number.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", cfg.agent_executable))?;

    {
        let mut s = state::lock(state);
        if let Some(record) = s.running_mut(display_number) {
            record.agent_pid = child.id();
            record.phase = TaskPhase::Executing;
            record.phase_detail = None;
        }
    }
    tracing::info!(
        task = display_number,
        pid = child.id(),
        agent = %cfg.agent_executable,
        "agent started"
    );

    let stdout = child
        .stdout
        .take()
        .context("failed to capture agent stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("failed to capture agent stderr")?;

    let stdout_task = tokio::spawn({
        let state = state.clone();
        async move {
            let mut reader = tokio::io::BufReader::new(stdout).lines();
            let mut session_id: Option<String> = None;
            while let Ok(Some(line)) = reader.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if session_id.is_none()
                    && let Some(sid) = extract_session_id(line)
                {
                    session_id = Some(sid);
                }
                let stuck = {
                    let mut s = state::lock(&state);
                    let Some(record) = s.running_mut(display_number) else {
                        continue;
                    };
                    record.last_output_at = OffsetDateTime::now_utc();
                    record.push_tail(line);
                    if record.phase == TaskPhase::Stuck {
                        None
                    } else if let Some(phrase) = scan_stuck(line) {
                        record.phase = TaskPhase::Stuck;
                        record.phase_detail = Some(format!("waiting on input: {phrase}"));
                        Some(phrase)
                    } else {
                        None
                    }
                };
                if let Some(phrase) = stuck {
                    tracing::warn!(task = display_number, phrase, "agent appears stuck on input");
                }
            }
            session_id
        }
    });

    let stderr_task = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr).lines();
        let mut tail = String::new();
        while let Ok(Some(line)) = reader.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if !tail.is_empty() {
                tail.push('\n');
            }
            tail.push_str(&line);
            if tail.len() > STDERR_KEEP {
                tail = tail_chars(&tail, STDERR_KEEP);
            }
        }
        tail
    });

    let deadline = tokio::time::sleep(cfg.task_timeout);
    tokio::pin!(deadline);

    let end = tokio::select! {
        res = child.wait() => {
            let status = res.context("failed to wait for agent")?;
            let session_id = stdout_task.await.unwrap_or(None);
            let stderr_tail = stderr_task.await.unwrap_or_default();
            RunEnd::Exited {
                code: status.code().unwrap_or(-1),
                session_id,
                stderr_tail,
            }
        }
        () = &mut deadline => {
            tracing::warn!(
                task = display_number,
                limit_secs = cfg.task_timeout.as_secs(),
                "agent hit wall-clock limit, terminating"
            );
            terminate(&mut child).await;
            // Orphaned grandchildren can keep the pipes open; don't wait on
            // output that is no longer wanted.
            stdout_task.abort();
            stderr_task.abort();
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            RunEnd::TimedOut { elapsed_secs: started.elapsed().as_secs() }
        }
        () = cancel.cancelled() => {
            tracing::info!(task = display_number, "daemon stopping, terminating agent");
            terminate(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            RunEnd::Shutdown
        }
    };

    Ok(end)
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        crate::daemon::send_sigterm(pid);
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// The instruction handed to the agent: task content plus the standing
/// trailer about conventions, committing, and exiting.
#[must_use]
pub fn compose_prompt(task: &Task, auto_commit: bool) -> String {
    let mut prompt = format!(
        "Work on Push task #{}:\n\n{}\n\n",
        task.display_number,
        task.instruction()
    );
    prompt.push_str(
        "If the repository has a CLAUDE.md or similar convention file, read it before making changes.\n",
    );
    if auto_commit {
        prompt.push_str("Commit all of your changes before finishing.\n");
    }
    prompt.push_str("Exit cleanly when the task is complete.");
    prompt
}

#[must_use]
pub fn scan_stuck(line: &str) -> Option<&'static str> {
    let lower = line.to_ascii_lowercase();
    STUCK_PHRASES.iter().find(|p| lower.contains(**p)).copied()
}

/// A stdout line parseable as a JSON object with a string `session_id` is
/// recognized anywhere in the stream.
#[must_use]
pub fn extract_session_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

/// Last `n` characters of a string, on a char boundary.
#[must_use]
pub fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        s.to_owned()
    } else {
        s.chars().skip(count - n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_phrases_match_case_insensitively() {
        assert_eq!(
            scan_stuck("Waiting for permission to run Bash"),
            Some("waiting for permission")
        );
        assert_eq!(scan_stuck("Continue? [Y/N]"), Some("y/n"));
        assert_eq!(
            scan_stuck("PLAN READY FOR APPROVAL - review below"),
            Some("plan ready for approval")
        );
        assert!(scan_stuck("compiling crate foo v0.1.0").is_none());
    }

    #[test]
    fn session_id_extracted_from_json_lines() {
        assert_eq!(
            extract_session_id(r#"{"session_id":"S-1","cost_usd":0.2}"#).as_deref(),
            Some("S-1")
        );
        assert!(extract_session_id(r#"{"result":"done"}"#).is_none());
        assert!(extract_session_id("plain text with session_id inside").is_none());
        assert!(extract_session_id(r#"{"session_id": 42}"#).is_none());
    }

    #[test]
    fn prompt_carries_instruction_and_trailer() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "t-1",
            "displayNumber": 427,
            "summary": "fix login",
            "normalizedContent": "fix the login flow",
        }))
        .unwrap();

        let prompt = compose_prompt(&task, true);
        assert!(prompt.contains("#427"));
        assert!(prompt.contains("fix the login flow"));
        assert!(prompt.contains("Commit all of your changes"));
        assert!(prompt.ends_with("Exit cleanly when the task is complete."));

        let prompt = compose_prompt(&task, false);
        assert!(!prompt.contains("Commit all of your changes"));
    }

    #[test]
    fn tail_chars_respects_boundaries() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
    }
}
