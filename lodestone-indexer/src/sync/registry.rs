//! Task registry: owns every live task from creation until removal.
//!
//! Tasks live in an arena of slots addressed by generation-checked handles,
//! so a handle that survived its task's removal can never address a
//! recycled slot. All mutation happens on the controller's owning context;
//! the spawned worker only ever communicates back through the event inbox.

use std::time::Instant;

use lodestone_common::dto::TaskStatus;
use lodestone_common::models::BlockRange;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::task::{drive, SyncTask, TaskError, TaskEvent};

/// Generation-checked handle to a registered task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId {
    slot: u32,
    generation: u32,
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.{}", self.slot, self.generation)
    }
}

impl TaskId {
    #[cfg(test)]
    pub(crate) fn mock() -> Self {
        TaskId { slot: 0, generation: 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Succeeded,
    Errored,
}

pub(super) struct TaskEntry {
    pub name: String,
    pub range: Option<BlockRange>,
    pub created_at: Instant,
    pub state: TaskState,
    pub progress: f64,
    pub error: Option<TaskError>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct TaskRegistry {
    slots: Vec<Option<TaskEntry>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    events: mpsc::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new(events: mpsc::Sender<TaskEvent>) -> Self {
        Self { slots: Vec::new(), generations: Vec::new(), free: Vec::new(), events }
    }

    /// Registers `task` and schedules it to start. The entry is in the
    /// registry before this returns; the task body first runs when the
    /// executor next polls the spawned worker, never synchronously inside
    /// this call.
    pub fn spawn<T: SyncTask>(&mut self, task: T) -> TaskId {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.generations.push(0);
            (self.slots.len() - 1) as u32
        });
        let id = TaskId { slot, generation: self.generations[slot as usize] };

        let name = task.name();
        let range = task.range();
        let ctx = super::task::TaskContext::new(id, CancellationToken::new(), self.events.clone());
        let cancel = ctx.cancel_token();
        let join = tokio::spawn(drive(task, ctx));

        debug!(%id, name, "task registered");
        self.slots[slot as usize] = Some(TaskEntry {
            name,
            range,
            created_at: Instant::now(),
            state: TaskState::Created,
            progress: 0.0,
            error: None,
            cancel,
            join,
        });
        id
    }

    /// True iff `id` is not currently registered. Used defensively at every
    /// delayed-callback boundary.
    pub fn is_deleted(&self, id: TaskId) -> bool {
        self.get(id).is_none()
    }

    pub(super) fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        if self.generations.get(id.slot as usize) != Some(&id.generation) {
            return None;
        }
        self.slots
            .get(id.slot as usize)
            .and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskEntry> {
        if self.generations.get(id.slot as usize) != Some(&id.generation) {
            return None;
        }
        self.slots
            .get_mut(id.slot as usize)
            .and_then(Option::as_mut)
    }

    /// Detaches and destroys the entry. Called after the task signalled
    /// `finished`; calling it twice for the same handle is a programming
    /// error (asserted in debug builds, ignored in production).
    pub fn remove(&mut self, id: TaskId) {
        if self.get(id).is_none() {
            debug_assert!(false, "remove of unregistered task {id}");
            return;
        }
        self.slots[id.slot as usize] = None;
        self.generations[id.slot as usize] = self.generations[id.slot as usize].wrapping_add(1);
        self.free.push(id.slot);
        debug!(%id, "task removed");
    }

    pub fn mark_started(&mut self, id: TaskId) {
        if let Some(entry) = self.get_mut(id) {
            entry.state = TaskState::Started;
        }
    }

    pub fn mark_succeeded(&mut self, id: TaskId) {
        if let Some(entry) = self.get_mut(id) {
            entry.state = TaskState::Succeeded;
            entry.progress = 1.0;
        }
    }

    pub fn update_progress(&mut self, id: TaskId, progress: f64) {
        if let Some(entry) = self.get_mut(id) {
            // progress may arrive out of order; keep it monotone
            entry.progress = entry.progress.max(progress);
        }
    }

    pub fn record_error(&mut self, id: TaskId, error: TaskError) {
        if let Some(entry) = self.get_mut(id) {
            entry.state = TaskState::Errored;
            entry.error = Some(error);
        }
    }

    /// Requests cooperative cancellation of every live task.
    pub fn stop_all(&mut self) {
        for entry in self.slots.iter().flatten() {
            entry.cancel.cancel();
        }
    }

    /// Forcibly discards every live task, returning the join handles so
    /// the caller can await their termination.
    pub fn abort_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = entry.take() {
                entry.cancel.cancel();
                entry.join.abort();
                handles.push(entry.join);
                self.generations[slot] = self.generations[slot].wrapping_add(1);
                self.free.push(slot as u32);
            }
        }
        handles
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated headers landed by still-running tasks, from their last
    /// progress reports. Succeeded tasks are excluded; the controller
    /// accounts for those exactly.
    pub fn downloaded_estimate(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| entry.state != TaskState::Succeeded)
            .filter_map(|entry| {
                entry
                    .range
                    .map(|range| (entry.progress * range.len() as f64) as u64)
            })
            .sum()
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.slots
            .iter()
            .flatten()
            .map(|entry| TaskStatus {
                name: entry.name.clone(),
                age_ms: entry.created_at.elapsed().as_millis() as u64,
                progress: entry.progress,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::sync::task::{codes, TaskContext, TaskEventKind};

    struct ScriptedTask {
        result: Result<(), TaskError>,
    }

    #[async_trait]
    impl SyncTask for ScriptedTask {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        async fn run(self, ctx: &TaskContext) -> Result<(), TaskError> {
            ctx.progress(0.5).await;
            self.result
        }
    }

    struct HangingTask;

    #[async_trait]
    impl SyncTask for HangingTask {
        fn name(&self) -> String {
            "hanging".to_string()
        }

        async fn run(self, _ctx: &TaskContext) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    async fn next_kind(rx: &mut mpsc::Receiver<TaskEvent>) -> TaskEventKind {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open")
            .kind
    }

    #[tokio::test]
    async fn spawn_registers_before_the_body_runs() {
        let (tx, _rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        let id = registry.spawn(ScriptedTask { result: Ok(()) });
        assert!(!registry.is_deleted(id));
        assert_eq!(registry.get(id).map(|e| e.state), Some(TaskState::Created));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn successful_task_emits_the_full_lifecycle() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        let id = registry.spawn(ScriptedTask { result: Ok(()) });

        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Started);
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Progress(0.5));
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Succeeded);
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Finished);

        registry.remove(id);
        assert!(registry.is_deleted(id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn errored_task_reports_exactly_once_then_finishes() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        let error = TaskError::new(codes::RPC_TRANSIENT, "timed out");
        registry.spawn(ScriptedTask { result: Err(error.clone()) });

        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Started);
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Progress(0.5));
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Errored(error));
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Finished);
    }

    #[tokio::test]
    async fn stopped_task_finishes_without_success_or_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        registry.spawn(HangingTask);

        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Started);
        registry.stop_all();
        assert_eq!(next_kind(&mut rx).await, TaskEventKind::Finished);
    }

    #[tokio::test]
    async fn removed_handles_stay_deleted_across_slot_reuse() {
        let (tx, _rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        let first = registry.spawn(ScriptedTask { result: Ok(()) });
        registry.remove(first);

        let second = registry.spawn(ScriptedTask { result: Ok(()) });
        assert_ne!(first, second);
        assert!(registry.is_deleted(first));
        assert!(!registry.is_deleted(second));

        // delayed callbacks against the stale handle are ignored
        registry.update_progress(first, 0.9);
        registry.record_error(first, TaskError::new(codes::STORAGE, "late"));
        assert_eq!(registry.get(second).map(|e| e.progress), Some(0.0));
    }

    #[tokio::test]
    async fn abort_all_discards_everything() {
        let (tx, _rx) = mpsc::channel(8);
        let mut registry = TaskRegistry::new(tx);
        registry.spawn(HangingTask);
        registry.spawn(HangingTask);

        let handles = registry.abort_all();
        assert_eq!(handles.len(), 2);
        assert!(registry.is_empty());
        for handle in handles {
            // aborted or finished, either way the worker is gone
            let _ = handle.await;
        }
    }
}
