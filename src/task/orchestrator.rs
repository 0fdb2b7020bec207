//! Durable pipeline executor.
//!
//! A task is an ordered list of step tags. The orchestrator persists the task
//! before it starts, persists each subtask record before and after its handler
//! runs, and stops at the first failing step. A task that was interrupted
//! (process restart) is re-entered at its first subtask that has not succeeded.
//!
//! Every task runs under a [`Lease`] acquired before the pipeline is built.
//! The lease is released when the task reaches a terminal state, before
//! waiters are notified, so a caller that awaited [`TaskHandle::wait`] can
//! submit the next task for the same config straight away.

use super::context::{CancellationToken, FailureContext, StepContext};
use super::lease::{Lease, LeaseKey, LeaseMode, LeaseTable};
use super::registry::StepRegistry;
use super::types::{Task, TaskId, TaskSpec, TaskState};
use crate::store::TaskStore;
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Inner<S> {
    registry: StepRegistry<S>,
    store: Arc<dyn TaskStore>,
    leases: LeaseTable,
    services: Arc<S>,
    active: Mutex<HashMap<TaskId, CancellationToken>>,
}

pub struct Orchestrator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + Sync + 'static> Orchestrator<S> {
    pub fn new(registry: StepRegistry<S>, store: Arc<dyn TaskStore>, services: Arc<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                leases: LeaseTable::new(),
                services,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.inner.leases
    }

    pub fn services(&self) -> &Arc<S> {
        &self.inner.services
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// Take the lease `spec` will run under.
    ///
    /// Callers that must validate against current state before committing to
    /// a task acquire first, check, then hand the lease to [`Self::start`].
    pub fn acquire_lease(&self, spec: &TaskSpec) -> Result<Lease> {
        lease_for(&self.inner.leases, spec.id, spec.config_id, &spec.universe_ids)
    }

    /// Persist a new task and start running it under `lease`.
    pub async fn start(&self, spec: TaskSpec, lease: Lease) -> Result<TaskHandle> {
        if lease.owner() != spec.id {
            return Err(Error::Validation(format!(
                "lease owned by {} cannot run task {}",
                lease.owner(),
                spec.id
            )));
        }
        if spec.steps.is_empty() {
            return Err(Error::Validation(format!("task {} has no steps", spec.kind)));
        }
        self.check_registered(spec.steps.iter())?;

        let task = Task::from_spec(spec);
        self.inner.store.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            kind = %task.kind,
            steps = task.subtasks.len(),
            "Task submitted"
        );
        Ok(self.launch(task, lease))
    }

    /// Acquire the lease for `spec` and start it.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let lease = self.acquire_lease(&spec)?;
        self.start(spec, lease).await
    }

    /// Re-enter a persisted, unfinished task at its first non-successful subtask.
    pub async fn resume(&self, task_id: TaskId) -> Result<TaskHandle> {
        if self.is_active(task_id) {
            return Err(Error::Validation(format!("task {} is already running", task_id)));
        }
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if task.state.is_terminal() {
            return Err(Error::Validation(format!(
                "task {} already finished with {}",
                task_id, task.state
            )));
        }
        if task.state == TaskState::Unknown {
            return Err(Error::Validation(format!(
                "task {} is in an unrecognised state",
                task_id
            )));
        }
        self.check_registered(task.subtasks.iter().map(|s| &s.step))?;

        let lease = lease_for(&self.inner.leases, task.id, task.config_id, &task.universe_ids)?;
        info!(
            task_id = %task.id,
            kind = %task.kind,
            position = task.resume_position().unwrap_or(task.subtasks.len()),
            "Resuming task"
        );
        Ok(self.launch(task, lease))
    }

    /// Resume every Created or Running task left in the store.
    ///
    /// Tasks that cannot be resumed are logged and skipped.
    pub async fn resume_incomplete(&self) -> Result<Vec<TaskHandle>> {
        let mut handles = Vec::new();
        for task in self.inner.store.list_incomplete().await? {
            if self.is_active(task.id) {
                continue;
            }
            if task.state == TaskState::Unknown {
                warn!(task_id = %task.id, kind = %task.kind, "Skipping task in unrecognised state");
                continue;
            }
            match self.resume(task.id).await {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(task_id = %task.id, kind = %task.kind, "Cannot resume task: {}", e),
            }
        }
        Ok(handles)
    }

    /// Request an abort.
    ///
    /// A running task finishes its in-flight subtask and then moves to Abort.
    /// A persisted task that is not running here is marked Abort directly,
    /// with its failure hook run under the task's lease.
    pub async fn abort(&self, task_id: TaskId) -> Result<()> {
        let token = self.inner.active.lock().get(&task_id).cloned();
        if let Some(token) = token {
            info!(task_id = %task_id, "Abort requested");
            token.cancel();
            return Ok(());
        }

        let mut task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if task.state.is_terminal() {
            return Err(Error::Validation(format!(
                "task {} already finished with {}",
                task_id, task.state
            )));
        }
        let lease = lease_for(&self.inner.leases, task.id, task.config_id, &task.universe_ids)?;
        task.abort_requested = true;
        task.state = TaskState::Abort;
        if task.error.is_none() {
            task.error = Some("aborted while idle".to_string());
        }
        self.inner.run_failure_hook(&task).await;
        task.touch();
        self.inner.store.update_task(&task).await?;
        drop(lease);
        info!(task_id = %task_id, "Aborted idle task");
        Ok(())
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.inner.store.get_task(task_id).await
    }

    pub fn is_active(&self, task_id: TaskId) -> bool {
        self.inner.active.lock().contains_key(&task_id)
    }

    fn check_registered<'a>(&self, mut steps: impl Iterator<Item = &'a String>) -> Result<()> {
        match steps.find(|tag| !self.inner.registry.contains(tag)) {
            Some(tag) => Err(Error::Validation(format!("no handler registered for step {}", tag))),
            None => Ok(()),
        }
    }

    fn launch(&self, task: Task, lease: Lease) -> TaskHandle {
        let (state_tx, state_rx) = watch::channel(task.state);
        let cancel = CancellationToken::new();
        self.inner.active.lock().insert(task.id, cancel.clone());

        let handle = TaskHandle {
            id: task.id,
            state: state_rx,
            store: Arc::clone(&self.inner.store),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(task, lease, cancel, state_tx).await;
        });
        handle
    }
}

fn lease_for(
    leases: &LeaseTable,
    owner: TaskId,
    config_id: Option<Uuid>,
    universes: &[Uuid],
) -> Result<Lease> {
    match config_id {
        Some(config_id) => leases.acquire_for_config(owner, config_id, universes),
        None => {
            let requests: Vec<_> = universes
                .iter()
                .map(|u| (LeaseKey::Universe(*u), LeaseMode::Shared))
                .collect();
            leases.acquire(owner, &requests)
        }
    }
}

impl<S: Send + Sync + 'static> Inner<S> {
    async fn run(
        &self,
        mut task: Task,
        lease: Lease,
        cancel: CancellationToken,
        state_tx: watch::Sender<TaskState>,
    ) {
        let final_state = self.execute(&mut task, &cancel, &state_tx).await;
        task.state = final_state;

        if matches!(final_state, TaskState::Failure | TaskState::Abort) {
            self.run_failure_hook(&task).await;
        }

        task.touch();
        if let Err(e) = self.store.update_task(&task).await {
            error!(task_id = %task.id, "Failed to persist terminal state {}: {}", final_state, e);
        }
        match final_state {
            TaskState::Success => info!(task_id = %task.id, kind = %task.kind, "Task succeeded"),
            state => warn!(
                task_id = %task.id,
                kind = %task.kind,
                error = task.error.as_deref().unwrap_or(""),
                "Task ended with {}",
                state
            ),
        }

        self.active.lock().remove(&task.id);
        drop(lease);
        state_tx.send_replace(final_state);
    }

    async fn run_failure_hook(&self, task: &Task) {
        let Some(hook) = self.registry.failure_hook(&task.kind) else {
            return;
        };
        let ctx = FailureContext {
            task: task.clone(),
            services: Arc::clone(&self.services),
        };
        if let Err(e) = hook(&ctx).await {
            warn!(task_id = %task.id, kind = %task.kind, "Failure hook failed: {}", e);
        }
    }

    async fn execute(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
        state_tx: &watch::Sender<TaskState>,
    ) -> TaskState {
        task.state = TaskState::Running;
        task.touch();
        if let Err(e) = self.store.update_task(task).await {
            task.error = Some(format!("failed to persist task: {}", e));
            return TaskState::Failure;
        }
        state_tx.send_replace(TaskState::Running);

        let start = task.resume_position().unwrap_or(task.subtasks.len());
        for position in start..task.subtasks.len() {
            if cancel.is_cancelled() {
                task.abort_requested = true;
                task.error = Some("aborted".to_string());
                return TaskState::Abort;
            }

            let step = task.subtasks[position].step.clone();
            let Some(handler) = self.registry.get(&step) else {
                task.error = Some(format!("no handler registered for step {}", step));
                return TaskState::Failure;
            };

            {
                let subtask = &mut task.subtasks[position];
                subtask.state = TaskState::Running;
                subtask.attempts += 1;
                subtask.error = None;
                subtask.started_at = Some(Utc::now());
                subtask.finished_at = None;
            }
            task.touch();
            if let Err(e) = self.store.update_task(task).await {
                task.error = Some(format!("failed to persist subtask {}: {}", step, e));
                return TaskState::Failure;
            }
            debug!(task_id = %task.id, position, step = %step, "Running subtask");

            let ctx = StepContext::for_subtask(task, position, cancel.clone(), Arc::clone(&self.services));
            let result = handler(&ctx).await;

            let subtask = &mut task.subtasks[position];
            subtask.finished_at = Some(Utc::now());
            let outcome = match result {
                Ok(output) => {
                    subtask.state = TaskState::Success;
                    subtask.output = output;
                    None
                }
                Err(Error::Aborted) => {
                    subtask.state = TaskState::Abort;
                    subtask.error = Some(Error::Aborted.to_string());
                    task.abort_requested = true;
                    task.error = Some(format!("aborted during {}", step));
                    Some(TaskState::Abort)
                }
                Err(e) => {
                    warn!(task_id = %task.id, position, step = %step, "Subtask failed: {}", e);
                    subtask.state = TaskState::Failure;
                    subtask.error = Some(e.to_string());
                    task.error = Some(format!("{} failed: {}", step, e));
                    Some(TaskState::Failure)
                }
            };

            task.touch();
            if let Err(e) = self.store.update_task(task).await {
                task.error = Some(format!("failed to persist subtask {}: {}", step, e));
                return TaskState::Failure;
            }
            if let Some(state) = outcome {
                return state;
            }
        }

        TaskState::Success
    }
}

/// Handle to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    state: watch::Receiver<TaskState>,
    store: Arc<dyn TaskStore>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Last state published by the running task.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Wait until the task reaches a terminal state and return its record.
    pub async fn wait(&self) -> Result<Task> {
        let mut state = self.state.clone();
        // The sender is dropped once the terminal state is published; either
        // way the store already holds the final record.
        let _ = state.wait_for(|s| s.is_terminal()).await;
        self.store
            .get_task(self.id)
            .await?
            .ok_or_else(|| Error::not_found("task", self.id))
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::registry::StepOutput;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        first_runs: AtomicUsize,
        hook_calls: AtomicUsize,
    }

    fn first(ctx: &StepContext<Counters>) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let n = ctx.services.first_runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(serde_json::json!(n)))
        })
    }

    fn second(ctx: &StepContext<Counters>) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let prior: Option<usize> = ctx.output("first")?;
            Ok(Some(serde_json::json!(prior.unwrap_or(0) * 10)))
        })
    }

    fn broken(_ctx: &StepContext<Counters>) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move { Err(Error::remote("stream", "unreachable")) })
    }

    fn blocked(ctx: &StepContext<Counters>) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            ctx.wait_until(
                "release",
                Duration::from_secs(30),
                Duration::from_millis(5),
                || async { Ok(None::<()>) },
            )
            .await?;
            Ok(None)
        })
    }

    fn mark_hook(ctx: &FailureContext<Counters>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.services.hook_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn orchestrator() -> (Orchestrator<Counters>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = StepRegistry::new()
            .register("first", first)
            .register("second", second)
            .register("broken", broken)
            .register("blocked", blocked)
            .on_failure("demo", mark_hook);
        let orch = Orchestrator::new(registry, store.clone(), Arc::new(Counters::default()));
        (orch, store)
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_order_and_passes_outputs() {
        let (orch, _store) = orchestrator();
        let handle = orch
            .submit(TaskSpec::new("demo").step("first").step("second"))
            .await
            .unwrap();
        let task = handle.wait().await.unwrap();

        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.subtasks[1].output, Some(serde_json::json!(10)));
        assert!(task.subtasks.iter().all(|s| s.attempts == 1));
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_failure_halts_pipeline() {
        let (orch, _store) = orchestrator();
        let task = orch
            .submit(TaskSpec::new("demo").step("broken").step("first"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Failure);
        assert_eq!(task.subtasks[0].state, TaskState::Failure);
        assert_eq!(task.subtasks[1].state, TaskState::Created);
        assert!(task.error.unwrap().contains("unreachable"));
        assert_eq!(orch.services().first_runs.load(Ordering::SeqCst), 0);
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_step_rejected_before_persisting() {
        let (orch, store) = orchestrator();
        let err = orch
            .submit(TaskSpec::new("demo").step("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_successful_subtasks() {
        let (orch, store) = orchestrator();
        let mut task = Task::from_spec(TaskSpec::new("demo").step("first").step("second"));
        task.state = TaskState::Running;
        task.subtasks[0].state = TaskState::Success;
        task.subtasks[0].output = Some(serde_json::json!(4));
        store.insert_task(&task).await.unwrap();

        let handles = orch.resume_incomplete().await.unwrap();
        assert_eq!(handles.len(), 1);
        let done = handles[0].wait().await.unwrap();

        assert_eq!(done.state, TaskState::Success);
        assert_eq!(done.subtasks[1].output, Some(serde_json::json!(40)));
        assert_eq!(orch.services().first_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_config_lease_held_until_terminal() {
        let (orch, _store) = orchestrator();
        let config_id = Uuid::new_v4();

        let running = orch
            .submit(TaskSpec::new("demo").for_config(config_id).step("blocked"))
            .await
            .unwrap();
        let err = orch
            .submit(TaskSpec::new("demo").for_config(config_id).step("first"))
            .await
            .unwrap_err();
        match err {
            Error::ConcurrencyConflict { holder, .. } => assert_eq!(holder, running.id()),
            other => panic!("unexpected error: {other}"),
        }

        orch.abort(running.id()).await.unwrap();
        let aborted = running.wait().await.unwrap();
        assert_eq!(aborted.state, TaskState::Abort);
        assert!(aborted.abort_requested);
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 1);

        // Released before waiters were woken.
        let next = orch
            .submit(TaskSpec::new("demo").for_config(config_id).step("first"))
            .await
            .unwrap();
        assert_eq!(next.wait().await.unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_abort_idle_task_marks_it_directly() {
        let (orch, store) = orchestrator();
        let task = Task::from_spec(TaskSpec::new("demo").step("first"));
        store.insert_task(&task).await.unwrap();

        orch.abort(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Abort);
        assert!(stored.abort_requested);
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 1);
        assert!(orch.abort(task.id).await.is_err());
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            orch.abort(Uuid::new_v4()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_idle_task_waits_for_config_lease() {
        let (orch, store) = orchestrator();
        let config_id = Uuid::new_v4();
        let running = orch
            .submit(TaskSpec::new("demo").for_config(config_id).step("blocked"))
            .await
            .unwrap();
        let stranded = Task::from_spec(TaskSpec::new("demo").for_config(config_id).step("first"));
        store.insert_task(&stranded).await.unwrap();

        let err = orch.abort(stranded.id).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));
        let stored = store.get_task(stranded.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Created);

        orch.abort(running.id()).await.unwrap();
        running.wait().await.unwrap();
        orch.abort(stranded.id).await.unwrap();
        assert_eq!(orch.services().hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_unknown_state() {
        let (orch, store) = orchestrator();
        let mut task = Task::from_spec(TaskSpec::new("demo").step("first"));
        task.state = TaskState::Unknown;
        store.insert_task(&task).await.unwrap();

        assert!(orch.resume_incomplete().await.unwrap().is_empty());
        assert!(matches!(orch.resume(task.id).await, Err(Error::Validation(_))));
        assert_eq!(orch.services().first_runs.load(Ordering::SeqCst), 0);
    }
}
