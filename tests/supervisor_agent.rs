#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pushd::daemon::state::{self, SharedState};
use pushd::task::model::{RunningTask, Task, TaskPhase};
use pushd::task::supervisor::{RunEnd, SupervisorConfig, supervise};

fn fake_task(display_number: u64) -> Task {
    serde_json::from_value(serde_json::json!({
        "id": format!("t-{display_number}"),
        "displayNumber": display_number,
        "summary": "fix login",
        "normalizedContent": "fix the login flow",
    }))
    .unwrap()
}

fn write_agent(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write agent");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod agent");
    path
}

fn registered_state(task: &Task, worktree: &Path) -> SharedState {
    let state = state::shared();
    state::lock(&state).try_insert_running(RunningTask::new(
        task,
        worktree.to_path_buf(),
        worktree.to_path_buf(),
        format!("push-{}-a1b2c3d4", task.display_number),
    ));
    state
}

fn config_for(agent: &Path) -> SupervisorConfig {
    SupervisorConfig {
        agent_executable: agent.to_string_lossy().into_owned(),
        allowed_tools: None,
        task_timeout: Duration::from_secs(30),
        auto_commit: true,
    }
}

#[tokio::test]
async fn clean_exit_yields_session_id_and_output_tracking() {
    let td = tempfile::tempdir().expect("tempdir");
    let task = fake_task(427);
    let agent = write_agent(
        td.path(),
        r#"echo "working on task $PUSH_DISPLAY_NUMBER"
echo '{"type":"status","detail":"editing"}'
echo '{"session_id":"S-1","cost_usd":0.02}'
exit 0"#,
    );
    let state = registered_state(&task, td.path());
    let cancel = CancellationToken::new();

    let end = supervise(&config_for(&agent), &state, &task, td.path(), &cancel)
        .await
        .expect("supervise");

    match end {
        RunEnd::Exited {
            code,
            session_id,
            stderr_tail,
        } => {
            assert_eq!(code, 0);
            assert_eq!(session_id.as_deref(), Some("S-1"));
            assert!(stderr_tail.is_empty());
        }
        other => panic!("unexpected end: {other:?}"),
    }

    let s = state::lock(&state);
    let record = s.running_snapshot().into_iter().next().expect("record");
    assert_eq!(record.phase, TaskPhase::Executing);
    assert!(record.agent_pid.is_some());
    // The exported display number reached the child and came back on stdout.
    assert!(
        record
            .tail
            .iter()
            .any(|line| line.contains("working on task 427")),
        "tail: {:?}",
        record.tail
    );
}

#[tokio::test]
async fn failing_agent_reports_exit_code_and_stderr() {
    let td = tempfile::tempdir().expect("tempdir");
    let task = fake_task(601);
    let agent = write_agent(
        td.path(),
        r#"echo "starting"
echo "boom: disk exploded" >&2
exit 3"#,
    );
    let state = registered_state(&task, td.path());
    let cancel = CancellationToken::new();

    let end = supervise(&config_for(&agent), &state, &task, td.path(), &cancel)
        .await
        .expect("supervise");

    match end {
        RunEnd::Exited {
            code,
            session_id,
            stderr_tail,
        } => {
            assert_eq!(code, 3);
            assert!(session_id.is_none());
            assert!(stderr_tail.contains("boom: disk exploded"));
        }
        other => panic!("unexpected end: {other:?}"),
    }
}

#[tokio::test]
async fn stuck_phrase_flips_phase_once() {
    let td = tempfile::tempdir().expect("tempdir");
    let task = fake_task(77);
    let agent = write_agent(
        td.path(),
        r#"echo "Waiting for permission to run Bash"
echo "still Waiting for permission"
exit 0"#,
    );
    let state = registered_state(&task, td.path());
    let cancel = CancellationToken::new();

    let end = supervise(&config_for(&agent), &state, &task, td.path(), &cancel)
        .await
        .expect("supervise");
    assert!(matches!(end, RunEnd::Exited { code: 0, .. }));

    let s = state::lock(&state);
    let record = s.running_snapshot().into_iter().next().expect("record");
    assert_eq!(record.phase, TaskPhase::Stuck);
    assert_eq!(
        record.phase_detail.as_deref(),
        Some("waiting on input: waiting for permission")
    );
}

#[tokio::test]
async fn wall_clock_timeout_terminates_the_agent() {
    let td = tempfile::tempdir().expect("tempdir");
    let task = fake_task(601);
    let agent = write_agent(td.path(), "exec sleep 60");
    let state = registered_state(&task, td.path());
    let cancel = CancellationToken::new();

    let mut cfg = config_for(&agent);
    cfg.task_timeout = Duration::from_millis(300);

    let started = std::time::Instant::now();
    let end = supervise(&cfg, &state, &task, td.path(), &cancel)
        .await
        .expect("supervise");

    assert!(matches!(end, RunEnd::TimedOut { .. }));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "termination should not wait for the full sleep"
    );
}

#[tokio::test]
async fn daemon_shutdown_cancels_the_run() {
    let td = tempfile::tempdir().expect("tempdir");
    let task = fake_task(700);
    let agent = write_agent(td.path(), "exec sleep 60");
    let state = registered_state(&task, td.path());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let end = supervise(&config_for(&agent), &state, &task, td.path(), &cancel)
        .await
        .expect("supervise");
    assert!(matches!(end, RunEnd::Shutdown));
}
