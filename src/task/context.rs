use super::types::{Task, TaskId};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

/// Cooperative abort signal shared between the orchestrator and a running task.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Explicit context handed to every step handler.
pub struct StepContext<S> {
    pub task_id: TaskId,
    pub kind: String,
    pub config_id: Option<Uuid>,
    pub universe_ids: Vec<Uuid>,
    pub position: usize,
    pub step: String,
    pub cancel: CancellationToken,
    pub services: Arc<S>,
    params: serde_json::Value,
    outputs: BTreeMap<String, serde_json::Value>,
}

impl<S> StepContext<S> {
    pub(crate) fn for_subtask(
        task: &Task,
        position: usize,
        cancel: CancellationToken,
        services: Arc<S>,
    ) -> Self {
        let outputs = task.subtasks[..position]
            .iter()
            .filter_map(|s| s.output.clone().map(|o| (s.step.clone(), o)))
            .collect();
        Self {
            task_id: task.id,
            kind: task.kind.clone(),
            config_id: task.config_id,
            universe_ids: task.universe_ids.clone(),
            position,
            step: task.subtasks[position].step.clone(),
            cancel,
            services,
            params: task.params.clone(),
            outputs,
        }
    }

    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.params.clone())?)
    }

    /// Output recorded by an earlier step of this task.
    pub fn output<T: DeserializeOwned>(&self, step: &str) -> Result<Option<T>> {
        self.outputs
            .get(step)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    pub fn config_id(&self) -> Result<Uuid> {
        self.config_id.ok_or_else(|| {
            Error::Validation(format!("task {} has no owning config", self.task_id))
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll `check` until it yields a value, the timeout elapses, or the task
    /// is aborted. The abort check sits between polls, never inside one.
    pub async fn wait_until<T, F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        poll: Duration,
        mut check: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            if self.is_cancelled() {
                debug!(task_id = %self.task_id, what, "Wait interrupted by abort");
                return Err(Error::Aborted);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    message: format!("{} did not finish within {:?}", what, timeout),
                });
            }
            sleep(poll).await;
        }
    }
}

/// Context handed to a task kind's failure hook.
pub struct FailureContext<S> {
    pub task: Task,
    pub services: Arc<S>,
}
