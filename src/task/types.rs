use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Running,
    Success,
    Failure,
    Abort,
    /// Persisted state this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Abort
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "Created",
            TaskState::Running => "Running",
            TaskState::Success => "Success",
            TaskState::Failure => "Failure",
            TaskState::Abort => "Abort",
            TaskState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub position: usize,
    pub step: String,
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<String>,
    /// Value returned by the step handler, readable by later steps.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubtaskRecord {
    fn new(position: usize, step: impl Into<String>) -> Self {
        Self {
            position,
            step: step.into(),
            state: TaskState::Created,
            error: None,
            output: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    pub state: TaskState,
    /// Config this task mutates, if any.
    #[serde(default)]
    pub config_id: Option<Uuid>,
    #[serde(default)]
    pub universe_ids: Vec<Uuid>,
    #[serde(default)]
    pub params: serde_json::Value,
    pub subtasks: Vec<SubtaskRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            kind: spec.kind,
            state: TaskState::Created,
            config_id: spec.config_id,
            universe_ids: spec.universe_ids,
            params: spec.params,
            subtasks: spec
                .steps
                .into_iter()
                .enumerate()
                .map(|(position, step)| SubtaskRecord::new(position, step))
                .collect(),
            error: None,
            abort_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Position of the first subtask that has not succeeded.
    pub fn resume_position(&self) -> Option<usize> {
        self.subtasks
            .iter()
            .position(|s| s.state != TaskState::Success)
    }

    pub fn output_of(&self, step: &str) -> Option<&serde_json::Value> {
        self.subtasks
            .iter()
            .find(|s| s.step == step && s.state == TaskState::Success)
            .and_then(|s| s.output.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Everything needed to build a task before it is persisted.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub kind: String,
    pub config_id: Option<Uuid>,
    pub universe_ids: Vec<Uuid>,
    pub params: serde_json::Value,
    pub steps: Vec<String>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            config_id: None,
            universe_ids: Vec::new(),
            params: serde_json::Value::Null,
            steps: Vec::new(),
        }
    }

    pub fn for_config(mut self, config_id: Uuid) -> Self {
        self.config_id = Some(config_id);
        self
    }

    pub fn universes(mut self, universe_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.universe_ids = universe_ids.into_iter().collect();
        self
    }

    pub fn params<T: Serialize>(mut self, params: &T) -> crate::Result<Self> {
        self.params = serde_json::to_value(params)?;
        Ok(self)
    }

    pub fn step(mut self, tag: impl Into<String>) -> Self {
        self.steps.push(tag.into());
        self
    }
}
