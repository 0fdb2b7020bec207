//! Generic task orchestration: persisted step pipelines, leases, resume and abort.

pub mod context;
pub mod lease;
pub mod orchestrator;
pub mod registry;
pub mod types;

pub use context::{CancellationToken, FailureContext, StepContext};
pub use lease::{Lease, LeaseKey, LeaseMode, LeaseTable};
pub use orchestrator::{Orchestrator, TaskHandle};
pub use registry::{FailureHookFn, StepFn, StepOutput, StepRegistry};
pub use types::{SubtaskRecord, Task, TaskId, TaskSpec, TaskState};
