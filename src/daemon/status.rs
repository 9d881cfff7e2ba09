#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::write_json_atomic;
use crate::daemon::state::{self, SharedState};
use crate::task::model::{CompletedTask, TaskPhase, now_rfc3339};

/// Completed entries exposed in the snapshot.
const COMPLETED_SHOWN: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonInfo {
    pub pid: u32,
    pub version: String,
    pub started_at: String,
    pub machine_name: String,
    pub machine_id_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub display_number: u64,
    pub summary: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub running: usize,
    pub max_concurrent: usize,
    pub completed_today: usize,
}

/// Ground truth for the CLI watch mode and ad-hoc status queries. There is
/// no IPC channel besides this file and the PID file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub daemon: DaemonInfo,
    pub running: bool,
    pub active_tasks: Vec<ActiveTask>,
    pub running_tasks: Vec<ActiveTask>,
    pub queued_tasks: Vec<ActiveTask>,
    pub completed_today: Vec<CompletedTask>,
    pub stats: Stats,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
}

/// Writes `daemon_status.json` after every meaningful state change. Writes
/// are temp-then-rename so readers never see partial JSON.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    path: PathBuf,
    daemon: DaemonInfo,
    state: SharedState,
    max_concurrent: usize,
}

impl StatusPublisher {
    #[must_use]
    pub fn new(
        path: PathBuf,
        daemon: DaemonInfo,
        state: SharedState,
        max_concurrent: usize,
    ) -> Self {
        Self {
            path,
            daemon,
            state,
            max_concurrent,
        }
    }

    #[must_use]
    pub fn snapshot(&self, running: bool) -> StatusSnapshot {
        let s = state::lock(&self.state);

        let running_tasks: Vec<ActiveTask> = s
            .running_snapshot()
            .into_iter()
            .map(|record| ActiveTask {
                display_number: record.display_number,
                summary: record.summary.clone(),
                status: "running".to_owned(),
                phase: Some(record.phase),
                detail: record.phase_detail.clone(),
                started_at: Some(
                    record
                        .started_at
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_else(|_| "unknown".to_owned()),
                ),
                elapsed_seconds: Some(record.elapsed_seconds()),
            })
            .collect();

        let queued_tasks: Vec<ActiveTask> = s
            .queued()
            .iter()
            .map(|q| ActiveTask {
                display_number: q.display_number,
                summary: q.summary.clone(),
                status: "queued".to_owned(),
                phase: None,
                detail: None,
                started_at: None,
                elapsed_seconds: None,
            })
            .collect();

        let completed = s.completed_today();
        let completed_today: Vec<CompletedTask> = completed
            .iter()
            .rev()
            .take(COMPLETED_SHOWN)
            .rev()
            .cloned()
            .collect();

        let mut active_tasks = running_tasks.clone();
        active_tasks.extend(queued_tasks.iter().cloned());

        StatusSnapshot {
            daemon: self.daemon.clone(),
            running,
            stats: Stats {
                running: running_tasks.len(),
                max_concurrent: self.max_concurrent,
                completed_today: completed.len(),
            },
            active_tasks,
            running_tasks,
            queued_tasks,
            completed_today,
            updated_at: now_rfc3339(),
            stopped_at: None,
        }
    }

    pub fn publish(&self) {
        let snapshot = self.snapshot(true);
        self.write(&snapshot);
    }

    /// Final snapshot on shutdown: `running: false` plus a stop timestamp.
    pub fn publish_final(&self) {
        let mut snapshot = self.snapshot(false);
        snapshot.stopped_at = Some(now_rfc3339());
        self.write(&snapshot);
    }

    fn write(&self, snapshot: &StatusSnapshot) {
        let data = match serde_json::to_vec_pretty(snapshot) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize status snapshot");
                return;
            }
        };
        if let Err(e) = write_json_atomic(&self.path, &data) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to write status file");
        }
    }
}

/// Read a snapshot back; `None` when the file is absent or unparseable.
#[must_use]
pub fn read_snapshot(path: &std::path::Path) -> Option<StatusSnapshot> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::state::QueuedTask;
    use crate::task::model::{RunningTask, Task, TaskOutcome};
    use std::path::Path;

    fn publisher(dir: &Path, state: SharedState) -> StatusPublisher {
        StatusPublisher::new(
            dir.join("daemon_status.json"),
            DaemonInfo {
                pid: 4242,
                version: "0.5.0".to_owned(),
                started_at: now_rfc3339(),
                machine_name: "buildbox".to_owned(),
                machine_id_suffix: "a1b2c3d4".to_owned(),
            },
            state,
            5,
        )
    }

    fn running_record(display_number: u64) -> RunningTask {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": format!("t-{display_number}"),
            "displayNumber": display_number,
            "summary": "fix login",
        }))
        .unwrap();
        RunningTask::new(
            &task,
            PathBuf::from("/repo"),
            PathBuf::from("/wt"),
            format!("push-{display_number}-a1b2c3d4"),
        )
    }

    #[test]
    fn snapshot_shape_and_atomic_write() {
        let td = tempfile::tempdir().expect("tempdir");
        let state = state::shared();
        {
            let mut s = state::lock(&state);
            s.try_insert_running(running_record(427));
            s.set_queued(vec![QueuedTask {
                display_number: 500,
                summary: "queued one".to_owned(),
            }]);
        }
        let publisher = publisher(td.path(), state);
        publisher.publish();

        let raw = std::fs::read_to_string(td.path().join("daemon_status.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["daemon"]["pid"], 4242);
        assert_eq!(v["daemon"]["machineIdSuffix"], "a1b2c3d4");
        assert_eq!(v["running"], true);
        assert_eq!(v["runningTasks"][0]["displayNumber"], 427);
        assert_eq!(v["queuedTasks"][0]["status"], "queued");
        assert_eq!(v["activeTasks"].as_array().unwrap().len(), 2);
        assert_eq!(v["stats"]["running"], 1);
        assert_eq!(v["stats"]["maxConcurrent"], 5);
        assert!(!td.path().join("daemon_status.json.tmp").exists());
    }

    #[test]
    fn completed_today_shows_last_ten() {
        let td = tempfile::tempdir().expect("tempdir");
        let state = state::shared();
        {
            let mut s = state::lock(&state);
            for i in 0..15u64 {
                s.note_completed(CompletedTask {
                    display_number: i,
                    summary: format!("task {i}"),
                    completed_at: now_rfc3339(),
                    duration_seconds: 10,
                    outcome: TaskOutcome::SessionFinished,
                    session_id: None,
                    pr_url: None,
                });
            }
        }
        let publisher = publisher(td.path(), state);
        let snapshot = publisher.snapshot(true);
        assert_eq!(snapshot.completed_today.len(), 10);
        assert_eq!(snapshot.completed_today[0].display_number, 5);
        assert_eq!(snapshot.completed_today[9].display_number, 14);
        assert_eq!(snapshot.stats.completed_today, 15);
    }

    #[test]
    fn final_snapshot_reports_stopped() {
        let td = tempfile::tempdir().expect("tempdir");
        let publisher = publisher(td.path(), state::shared());
        publisher.publish_final();

        let snapshot = read_snapshot(&td.path().join("daemon_status.json")).unwrap();
        assert!(!snapshot.running);
        assert!(snapshot.stopped_at.is_some());
    }
}
