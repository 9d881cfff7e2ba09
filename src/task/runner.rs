#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, StatusReport};
use crate::config::projects::ProjectRegistry;
use crate::config::{Paths, Settings};
use crate::core::worktree::{self, WorktreeManager};
use crate::daemon::state::{self, SharedState};
use crate::daemon::status::StatusPublisher;
use crate::error::PushdError;
use crate::task::model::{
    CompletedTask, EventType, ExecutionStatus, LifecycleEvent, RunningTask, Task, TaskOutcome,
    now_rfc3339,
};
use crate::task::pr;
use crate::task::supervisor::{self, RunEnd, SupervisorConfig};

/// Everything a single task run needs; cheap to clone per dispatch.
#[derive(Clone)]
pub struct RunContext {
    pub backend: Arc<BackendClient>,
    pub state: SharedState,
    pub registry: Arc<Mutex<ProjectRegistry>>,
    pub paths: Paths,
    pub status: Arc<StatusPublisher>,
    pub supervisor: SupervisorConfig,
    pub settings: Settings,
    pub cancel: CancellationToken,
}

/// Run one claimed-candidate task to completion: gate, claim, prepare,
/// dispatch, finalize. Owns the running-task record from claim until the
/// worktree is cleaned up.
pub async fn run_task(ctx: RunContext, task: Task) {
    let display_number = task.display_number;
    let machine_name = ctx.backend.machine().machine_name.clone();
    let suffix = ctx.backend.machine().suffix.clone();

    // Gate: the task must map to a registered, existing local checkout.
    let repo_path = lock_registry(&ctx.registry).local_path(&task.repo_url);
    let Some(repo_path) = repo_path else {
        let err = PushdError::ProjectNotRegistered(task.repo_url.clone());
        tracing::warn!(task = display_number, "{err}; leaving task queued");
        return;
    };
    if !repo_path.exists() {
        let err = PushdError::ProjectPathMissing {
            repo_url: task.repo_url.clone(),
            path: repo_path.clone(),
        };
        tracing::error!(task = display_number, "{err}");
        report(
            &ctx,
            StatusReport::new(display_number, ExecutionStatus::Failed)
                .with_error(err.to_string())
                .with_event(LifecycleEvent::now(EventType::Failed, &machine_name)),
        )
        .await;
        return;
    }

    // Fast-path local gate; the atomic claim below is the actual guarantee.
    if state::lock(&ctx.state).is_running(display_number) {
        tracing::debug!(task = display_number, "already running locally, skipping");
        return;
    }

    match ctx.backend.claim(display_number).await {
        Ok(outcome) if outcome.claimed => {}
        Ok(outcome) => {
            tracing::debug!(
                task = display_number,
                claimed_by = outcome.claimed_by.as_deref().unwrap_or("unknown"),
                "claimed by another machine, dropping"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(task = display_number, error = %e, "claim failed, will retry on a later tick");
            return;
        }
    }

    let branch = worktree::branch_name(display_number, &suffix);
    let worktree_path = worktree::worktree_path(&repo_path, &branch);
    let record = RunningTask::new(&task, repo_path.clone(), worktree_path, branch.clone());
    if !state::lock(&ctx.state).try_insert_running(record) {
        tracing::warn!(task = display_number, "record appeared after claim, dropping");
        return;
    }
    ctx.status.publish();

    let manager = WorktreeManager::new(repo_path.clone());
    let worktree_path = match manager.create(&branch).await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(task = display_number, error = %e, "worktree creation failed");
            report(
                &ctx,
                StatusReport::new(display_number, ExecutionStatus::Failed)
                    .with_error(format!("Failed to create git worktree: {e}"))
                    .with_event(LifecycleEvent::now(EventType::Failed, &machine_name)),
            )
            .await;
            state::lock(&ctx.state).remove_running(display_number);
            ctx.status.publish();
            return;
        }
    };

    {
        let mut registry = lock_registry(&ctx.registry);
        registry.touch_last_used(&task.repo_url);
        if let Err(e) = registry.save(&ctx.paths) {
            tracing::warn!(error = %e, "failed to persist registry last_used");
        }
    }

    report(
        &ctx,
        StatusReport::new(display_number, ExecutionStatus::Running)
            .with_event(LifecycleEvent::now(EventType::Started, &machine_name)),
    )
    .await;
    ctx.status.publish();

    let started = Instant::now();
    let end = supervisor::supervise(
        &ctx.supervisor,
        &ctx.state,
        &task,
        &worktree_path,
        &ctx.cancel,
    )
    .await;

    let duration_seconds = started.elapsed().as_secs();
    let (outcome, session_id, pr_url) =
        finalize(&ctx, &task, &repo_path, &worktree_path, &branch, end, duration_seconds).await;

    let completed = CompletedTask {
        display_number,
        summary: task.summary.clone(),
        completed_at: now_rfc3339(),
        duration_seconds,
        outcome,
        session_id,
        pr_url,
    };

    if let Err(e) = manager.remove(&worktree_path).await {
        tracing::warn!(task = display_number, error = %e, "worktree removal failed");
    }

    {
        let mut s = state::lock(&ctx.state);
        s.note_completed(completed);
        s.remove_running(display_number);
    }
    ctx.status.publish();
}

/// Report the terminal state for a finished supervision and return the
/// completed-today fields.
async fn finalize(
    ctx: &RunContext,
    task: &Task,
    repo_path: &Path,
    worktree_path: &Path,
    branch: &str,
    end: anyhow::Result<RunEnd>,
    duration_seconds: u64,
) -> (TaskOutcome, Option<String>, Option<String>) {
    let display_number = task.display_number;
    let machine_name = &ctx.backend.machine().machine_name;

    match end {
        Ok(RunEnd::Exited {
            code: 0,
            session_id,
            ..
        }) => {
            let pr_url = pr::open_pull_request(
                repo_path,
                worktree_path,
                branch,
                task,
                ctx.settings.auto_merge,
            )
            .await;

            let mut summary = format!(
                "Completed in {} on {machine_name}",
                format_duration(duration_seconds)
            );
            if let Some(url) = &pr_url {
                summary.push_str(&format!(" (PR: {url})"));
            }

            let mut event = LifecycleEvent::now(EventType::SessionFinished, machine_name)
                .with_summary(summary.clone());
            let mut status =
                StatusReport::new(display_number, ExecutionStatus::SessionFinished)
                    .with_summary(summary);
            if let Some(sid) = &session_id {
                status = status.with_session_id(sid.clone());
                event = event.with_session_id(sid.clone());
            }
            if let Some(url) = &pr_url {
                status = status.with_pr_url(url.clone());
            }
            report(ctx, status.with_event(event)).await;
            tracing::info!(task = display_number, "task finished");
            (TaskOutcome::SessionFinished, session_id, pr_url)
        }
        Ok(RunEnd::Exited {
            code,
            session_id,
            stderr_tail,
        }) => {
            let error = format!(
                "Agent exited with code {code}: {}",
                supervisor::tail_chars(&stderr_tail, 200)
            );
            tracing::error!(task = display_number, code, "agent failed");
            report(
                ctx,
                StatusReport::new(display_number, ExecutionStatus::Failed)
                    .with_error(error)
                    .with_event(LifecycleEvent::now(EventType::Failed, machine_name)),
            )
            .await;
            (TaskOutcome::Failed, session_id, None)
        }
        Ok(RunEnd::TimedOut { elapsed_secs }) => {
            let error = timeout_reason(elapsed_secs, ctx.supervisor.task_timeout.as_secs());
            tracing::error!(task = display_number, elapsed_secs, "task timed out");
            report(
                ctx,
                StatusReport::new(display_number, ExecutionStatus::Failed)
                    .with_error(error.clone())
                    .with_event(
                        LifecycleEvent::now(EventType::Failed, machine_name).with_summary(error),
                    ),
            )
            .await;
            (TaskOutcome::Timeout, None, None)
        }
        Ok(RunEnd::Shutdown) => {
            report(
                ctx,
                StatusReport::new(display_number, ExecutionStatus::Failed)
                    .with_error("daemon shut down while task was running".to_owned())
                    .with_event(LifecycleEvent::now(EventType::DaemonShutdown, machine_name)),
            )
            .await;
            (TaskOutcome::Failed, None, None)
        }
        Err(e) => {
            tracing::error!(task = display_number, error = %e, "supervision failed");
            report(
                ctx,
                StatusReport::new(display_number, ExecutionStatus::Failed)
                    .with_error(format!("Failed to start agent: {e}"))
                    .with_event(LifecycleEvent::now(EventType::Failed, machine_name)),
            )
            .await;
            (TaskOutcome::Failed, None, None)
        }
    }
}

async fn report(ctx: &RunContext, status: StatusReport) {
    if let Err(e) = ctx.backend.update_status(&status).await {
        tracing::error!(
            task = status.display_number,
            error = %e,
            "failed to report status to backend"
        );
    }
}

fn lock_registry(
    registry: &Arc<Mutex<ProjectRegistry>>,
) -> std::sync::MutexGuard<'_, ProjectRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[must_use]
pub fn timeout_reason(elapsed_secs: u64, limit_secs: u64) -> String {
    format!("Task timed out after {elapsed_secs}s (limit: {limit_secs}s)")
}

#[must_use]
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let m = secs / 60;
        let s = secs % 60;
        if s == 0 { format!("{m}m") } else { format!("{m}m {s}s") }
    } else {
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        if m == 0 { format!("{h}h") } else { format!("{h}h {m}m") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reason_matches_expected_shape() {
        let reason = timeout_reason(3612, 3600);
        assert_eq!(reason, "Task timed out after 3612s (limit: 3600s)");
        let re = regex::Regex::new(r"Task timed out after 36\d\ds \(limit: 3600s\)").unwrap();
        assert!(re.is_match(&reason));
    }

    #[test]
    fn durations_render_like_the_watch_ui() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(60), "1m");
        assert_eq!(format_duration(200), "3m 20s");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(3900), "1h 5m");
    }
}
