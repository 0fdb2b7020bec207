//! Step tag → handler function registry.
//!
//! Handlers are plain functions over a typed [`StepContext`]; a task records
//! only the tags, so a persisted task can be resumed by any process that
//! registered the same tags.

use super::context::{FailureContext, StepContext};
use crate::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;

/// Optional JSON value a step leaves for later steps of the same task.
pub type StepOutput = Option<serde_json::Value>;

pub type StepFn<S> = for<'a> fn(&'a StepContext<S>) -> BoxFuture<'a, Result<StepOutput>>;

pub type FailureHookFn<S> = for<'a> fn(&'a FailureContext<S>) -> BoxFuture<'a, Result<()>>;

pub struct StepRegistry<S> {
    steps: HashMap<&'static str, StepFn<S>>,
    failure_hooks: HashMap<&'static str, FailureHookFn<S>>,
}

impl<S> StepRegistry<S> {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            failure_hooks: HashMap::new(),
        }
    }

    pub fn register(mut self, tag: &'static str, handler: StepFn<S>) -> Self {
        self.steps.insert(tag, handler);
        self
    }

    /// Hook run under the task's lease when a task of `kind` ends in Failure or Abort.
    pub fn on_failure(mut self, kind: &'static str, hook: FailureHookFn<S>) -> Self {
        self.failure_hooks.insert(kind, hook);
        self
    }

    pub fn get(&self, tag: &str) -> Option<StepFn<S>> {
        self.steps.get(tag).copied()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.steps.contains_key(tag)
    }

    pub fn failure_hook(&self, kind: &str) -> Option<FailureHookFn<S>> {
        self.failure_hooks.get(kind).copied()
    }
}

impl<S> Default for StepRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
