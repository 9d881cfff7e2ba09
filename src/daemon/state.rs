#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::task::model::{CompletedTask, RunningTask};

/// Queued task snapshot for the status surface: polled from the backend but
/// not (yet) dispatched on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub display_number: u64,
    pub summary: String,
}

/// Process-memory daemon state. The scheduler tick adds running records, the
/// per-task finalizer removes them; supervisors only touch the output
/// tracking fields of their own record.
#[derive(Debug, Default)]
pub struct DaemonState {
    running: BTreeMap<u64, RunningTask>,
    completed_today: Vec<CompletedTask>,
    queued: Vec<QueuedTask>,
    draining: bool,
}

pub type SharedState = Arc<Mutex<DaemonState>>;

#[must_use]
pub fn shared() -> SharedState {
    Arc::new(Mutex::new(DaemonState::default()))
}

pub fn lock(state: &SharedState) -> MutexGuard<'_, DaemonState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DaemonState {
    /// Register a running task. Refuses a second record for the same display
    /// number; the claim protocol relies on this local gate staying closed.
    pub fn try_insert_running(&mut self, record: RunningTask) -> bool {
        let display_number = record.display_number;
        if self.running.contains_key(&display_number) {
            return false;
        }
        self.running.insert(display_number, record);
        true
    }

    pub fn remove_running(&mut self, display_number: u64) -> Option<RunningTask> {
        self.running.remove(&display_number)
    }

    #[must_use]
    pub fn is_running(&self, display_number: u64) -> bool {
        self.running.contains_key(&display_number)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    #[must_use]
    pub fn running_mut(&mut self, display_number: u64) -> Option<&mut RunningTask> {
        self.running.get_mut(&display_number)
    }

    #[must_use]
    pub fn running_snapshot(&self) -> Vec<RunningTask> {
        self.running.values().cloned().collect()
    }

    pub fn running_values_mut(&mut self) -> impl Iterator<Item = &mut RunningTask> {
        self.running.values_mut()
    }

    pub fn note_completed(&mut self, completed: CompletedTask) {
        self.completed_today.push(completed);
    }

    #[must_use]
    pub fn completed_today(&self) -> &[CompletedTask] {
        &self.completed_today
    }

    pub fn set_queued(&mut self, queued: Vec<QueuedTask>) {
        self.queued = queued;
    }

    #[must_use]
    pub fn queued(&self) -> &[QueuedTask] {
        &self.queued
    }

    pub fn set_draining(&mut self) {
        self.draining = true;
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::Task;
    use std::path::PathBuf;

    fn record(display_number: u64) -> RunningTask {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": format!("t-{display_number}"),
            "displayNumber": display_number,
            "summary": "s",
        }))
        .unwrap();
        RunningTask::new(
            &task,
            PathBuf::from("/repo"),
            PathBuf::from("/wt"),
            format!("push-{display_number}-abcd1234"),
        )
    }

    #[test]
    fn at_most_one_record_per_display_number() {
        let mut state = DaemonState::default();
        assert!(state.try_insert_running(record(427)));
        assert!(!state.try_insert_running(record(427)));
        assert_eq!(state.running_count(), 1);

        assert!(state.remove_running(427).is_some());
        assert!(state.try_insert_running(record(427)));
    }

    #[test]
    fn remove_returns_the_record() {
        let mut state = DaemonState::default();
        state.try_insert_running(record(7));
        let removed = state.remove_running(7).unwrap();
        assert_eq!(removed.display_number, 7);
        assert!(state.remove_running(7).is_none());
    }
}
