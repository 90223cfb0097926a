//! Task data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::protocol::{Bindings, CallFailure, EngineId, EngineRequest};

/// Identifier of a submitted task.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a task ID from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a [`Dependency`] compares an engine property with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Property equals the value.
    #[default]
    Eq,
    /// Property differs from the value, or is absent.
    Ne,
    /// Property is less than the value.
    Lt,
    /// Property is less than or equal to the value.
    Le,
    /// Property is greater than the value.
    Gt,
    /// Property is greater than or equal to the value.
    Ge,
    /// Property is a list holding the value, or a string containing it.
    Contains,
}

/// A requirement on the properties of the engine a task runs on.
///
/// Numbers compare numerically, strings lexically and booleans with
/// `false < true`. Any other pairing only satisfies `Ne`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    /// Property name.
    pub key: String,
    /// Value the property is compared against.
    #[serde(default = "Dependency::default_value")]
    pub value: Value,
    /// Comparison to apply.
    #[serde(default)]
    pub test: Comparison,
}

impl Dependency {
    /// Requires property `key` to equal `value`.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            test: Comparison::Eq,
        }
    }

    fn default_value() -> Value {
        Value::Bool(true)
    }

    /// Replaces the comparison.
    #[must_use]
    pub fn with_test(mut self, test: Comparison) -> Self {
        self.test = test;
        self
    }

    /// Whether an engine with `properties` satisfies the requirement.
    #[must_use]
    pub fn is_met(&self, properties: &Bindings) -> bool {
        let Some(actual) = properties.get(&self.key) else {
            return self.test == Comparison::Ne;
        };
        let ordering = compare(actual, &self.value);
        match self.test {
            Comparison::Eq => ordering.map_or(actual == &self.value, Ordering::is_eq),
            Comparison::Ne => !ordering.map_or(actual == &self.value, Ordering::is_eq),
            Comparison::Lt => ordering.is_some_and(Ordering::is_lt),
            Comparison::Le => ordering.is_some_and(Ordering::is_le),
            Comparison::Gt => ordering.is_some_and(Ordering::is_gt),
            Comparison::Ge => ordering.is_some_and(Ordering::is_ge),
            Comparison::Contains => match (actual, &self.value) {
                (Value::Array(items), value) => items.contains(value),
                (Value::String(text), Value::String(part)) => text.contains(part.as_str()),
                _ => false,
            },
        }
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A unit of work run on one engine: push inputs, execute code, pull
/// results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Task {
    /// Code executed in the engine namespace.
    pub code: String,
    /// Bindings pushed before the code runs.
    pub push: Bindings,
    /// Names pulled after the code runs.
    pub pull: Vec<String>,
    /// Retry budget; `None` uses the controller default.
    pub retries: Option<u32>,
    /// Reset the engine's user namespace before the task.
    pub clear_before: bool,
    /// Reset the engine's user namespace after the task.
    pub clear_after: bool,
    /// Task run once the retry budget is exhausted.
    pub recovery: Option<Box<Task>>,
    /// Requirements on the properties of the engine that runs the task.
    pub depend: Vec<Dependency>,
}

impl Task {
    /// Creates a task running `code`.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Adds an input binding.
    #[must_use]
    pub fn with_push(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push.insert(name.into(), value);
        self
    }

    /// Declares result names.
    #[must_use]
    pub fn with_pull<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pull.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Resets the namespace before running.
    #[must_use]
    pub fn clear_before(mut self) -> Self {
        self.clear_before = true;
        self
    }

    /// Resets the namespace after running.
    #[must_use]
    pub fn clear_after(mut self) -> Self {
        self.clear_after = true;
        self
    }

    /// Sets the recovery task.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Task) -> Self {
        self.recovery = Some(Box::new(recovery));
        self
    }

    /// Adds a requirement on the engine's properties.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.depend.push(dependency);
        self
    }

    /// Whether an engine with `properties` may run the task.
    #[must_use]
    pub fn runs_on(&self, properties: &Bindings) -> bool {
        self.depend
            .iter()
            .all(|dependency| dependency.is_met(properties))
    }

    /// The requests of one attempt, in the order the engine must see them.
    #[must_use]
    pub fn requests(&self) -> Vec<EngineRequest> {
        let mut requests = Vec::with_capacity(5);
        if self.clear_before {
            requests.push(EngineRequest::Reset);
        }
        if !self.push.is_empty() {
            requests.push(EngineRequest::Push {
                bindings: self.push.clone(),
            });
        }
        requests.push(EngineRequest::Execute {
            code: self.code.clone(),
        });
        if !self.pull.is_empty() {
            requests.push(EngineRequest::Pull {
                names: self.pull.clone(),
            });
        }
        if self.clear_after {
            requests.push(EngineRequest::Reset);
        }
        requests
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a free engine.
    Queued,
    /// Picked for an engine, requests not yet sent.
    Assigned,
    /// Requests in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the label used for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum TaskError {
    /// A call of the final attempt failed.
    #[error("{0}")]
    Call(CallFailure),
    /// The task was aborted by a client.
    #[error("task was aborted")]
    Aborted,
}

impl From<CallFailure> for TaskError {
    fn from(failure: CallFailure) -> Self {
        Self::Call(failure)
    }
}

/// Successful output of a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Pulled values by name.
    pub results: Bindings,
    /// Standard output of the execute step.
    pub stdout: String,
    /// Standard error of the execute step.
    pub stderr: String,
}

/// Final result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task ID.
    pub task_id: TaskId,
    /// Engine of the final attempt, if any attempt ran.
    pub engine_id: Option<EngineId>,
    /// Number of attempts started.
    pub attempts: u32,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Output or failure.
    pub outcome: Result<TaskOutput, TaskError>,
}

impl TaskResult {
    /// Terminal state implied by the outcome.
    #[must_use]
    pub fn state(&self) -> TaskState {
        if self.outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        }
    }
}

/// Task counts per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Tasks waiting for an engine.
    pub queued: usize,
    /// Tasks assigned or running.
    pub running: usize,
    /// Tasks finished successfully and not discarded.
    pub completed: usize,
    /// Tasks finished with an error and not discarded.
    pub failed: usize,
}
