//! Task queue and scheduling.
//!
//! `TaskController` is pure state: it decides which queued task runs on
//! which idle engine and what happens when an attempt finishes. The
//! controller actor performs the dispatch and feeds completed attempts
//! back in.

mod types;

pub use types::{
    Comparison, Dependency, Task, TaskError, TaskId, TaskOutput, TaskResult, TaskState,
    TaskStatus,
};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::pending::ResolvedCall;
use crate::protocol::{CallFailure, EngineId, EngineReply, EngineRequest, FailureKind, OpKind};
use crate::registry::IdleEngine;

/// Errors raised by task lookups and state changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskQueueError {
    /// No record exists for the task.
    #[error("task {0} does not exist")]
    UnknownTask(TaskId),
    /// The task has already finished.
    #[error("task {0} has already finished")]
    AlreadyFinished(TaskId),
    /// The task is already being aborted.
    #[error("task {0} is already being aborted")]
    AlreadyAborted(TaskId),
    /// The task has not finished yet.
    #[error("task {0} has not finished")]
    NotFinished(TaskId),
}

/// A queued task picked for an idle engine.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Task ID.
    pub task_id: TaskId,
    /// Chosen engine.
    pub engine_id: EngineId,
    /// Requests of this attempt, in engine order.
    pub requests: Vec<EngineRequest>,
}

/// Answer to a result query.
#[derive(Debug)]
pub enum TaskPoll {
    /// The task has finished.
    Ready(TaskResult),
    /// The task is still pending and the caller did not ask to block.
    Pending,
    /// The task is still pending; the receiver fires when it finishes.
    Waiting(oneshot::Receiver<TaskResult>),
}

struct TaskRecord {
    task: Task,
    state: TaskState,
    retries_left: u32,
    attempts: u32,
    avoid: Option<EngineId>,
    engine: Option<EngineId>,
    recovering: bool,
    aborted: bool,
    submitted_at: DateTime<Utc>,
    result: Option<TaskResult>,
}

/// FIFO task queue with one task per engine at a time.
pub struct TaskController {
    next_id: u64,
    default_retries: u32,
    queue: VecDeque<TaskId>,
    records: HashMap<TaskId, TaskRecord>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskResult>>>,
}

impl TaskController {
    /// Creates a controller whose tasks default to `default_retries`.
    #[must_use]
    pub fn new(default_retries: u32) -> Self {
        Self {
            next_id: 0,
            default_retries,
            queue: VecDeque::new(),
            records: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// Queues a task and returns its ID.
    pub fn submit(&mut self, task: Task) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        let retries_left = task.retries.unwrap_or(self.default_retries);
        self.records.insert(
            id,
            TaskRecord {
                task,
                state: TaskState::Queued,
                retries_left,
                attempts: 0,
                avoid: None,
                engine: None,
                recovering: false,
                aborted: false,
                submitted_at: Utc::now(),
                result: None,
            },
        );
        self.queue.push_back(id);
        debug!(task_id = %id, retries = retries_left, "Task queued");
        id
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Pairs queued tasks with idle engines, earliest task first.
    ///
    /// A task only goes to an engine whose properties satisfy its
    /// dependencies; a task no idle engine satisfies keeps its place and
    /// later tasks are considered. Among the eligible engines, the one the
    /// task just failed on is passed over when any other exists, then
    /// engines not marked suspect win, then the lowest ID.
    pub fn schedule(&mut self, mut idle: Vec<IdleEngine>) -> Vec<Assignment> {
        let mut assignments = Vec::new();
        let mut waiting = Vec::new();
        while !idle.is_empty() {
            let Some(task_id) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.records.get_mut(&task_id) else {
                continue;
            };

            let avoid = record.avoid;
            let Some(position) = idle
                .iter()
                .enumerate()
                .filter(|(_, engine)| record.task.runs_on(&engine.properties))
                .min_by_key(|(_, engine)| (Some(engine.id) == avoid, engine.suspect, engine.id))
                .map(|(position, _)| position)
            else {
                waiting.push(task_id);
                continue;
            };
            let engine = idle.remove(position);

            record.avoid = None;
            record.state = TaskState::Assigned;
            record.engine = Some(engine.id);
            record.attempts += 1;
            info!(
                task_id = %task_id,
                engine_id = %engine.id,
                attempt = record.attempts,
                "Task assigned"
            );
            assignments.push(Assignment {
                task_id,
                engine_id: engine.id,
                requests: record.task.requests(),
            });
        }
        for task_id in waiting.into_iter().rev() {
            self.queue.push_front(task_id);
        }
        assignments
    }

    /// Records that an assignment's requests are in flight.
    pub fn mark_running(&mut self, task_id: TaskId) {
        if let Some(record) = self.records.get_mut(&task_id) {
            record.state = TaskState::Running;
        }
    }

    /// Fails an assignment whose requests could not be dispatched.
    pub fn fail_dispatch(&mut self, task_id: TaskId, failure: CallFailure) -> Option<TaskResult> {
        warn!(task_id = %task_id, error = %failure, "Task could not be dispatched");
        self.finish(task_id, Err(TaskError::Call(failure)))
    }

    /// Puts an assignment back at the head of the queue without charging
    /// its retry budget.
    pub fn requeue(&mut self, task_id: TaskId) {
        if let Some(record) = self.records.get_mut(&task_id) {
            record.state = TaskState::Queued;
            record.engine = None;
            record.attempts = record.attempts.saturating_sub(1);
            self.queue.push_front(task_id);
        }
    }

    /// Applies the outcome of one attempt. Returns the result if the task
    /// reached a terminal state.
    pub fn on_attempt_complete(
        &mut self,
        task_id: TaskId,
        calls: &[ResolvedCall],
    ) -> Option<TaskResult> {
        let Some(record) = self.records.get_mut(&task_id) else {
            warn!(task_id = %task_id, "Attempt completed for unknown task");
            return None;
        };
        if record.state.is_terminal() {
            return None;
        }
        let engine_id = record.engine;

        if record.aborted {
            info!(task_id = %task_id, "Aborted task finished its attempt");
            return self.finish(task_id, Err(TaskError::Aborted));
        }

        let lost = calls.iter().any(|call| {
            matches!(&call.outcome, Err(failure) if failure.kind == FailureKind::EngineLost)
        });
        if lost {
            info!(task_id = %task_id, engine_id = ?engine_id, "Engine lost mid-task, requeueing");
            record.state = TaskState::Queued;
            record.engine = None;
            self.queue.push_front(task_id);
            return None;
        }

        let clear_after = record.task.clear_after;
        let last = calls.len().saturating_sub(1);
        let failure = calls
            .iter()
            .enumerate()
            .filter(|(index, call)| !(clear_after && *index == last && call.kind == OpKind::Reset))
            .find_map(|(_, call)| call.outcome.as_ref().err().cloned());

        match failure {
            None => {
                let output = Self::collect_output(&record.task, calls);
                info!(task_id = %task_id, engine_id = ?engine_id, "Task completed");
                self.finish(task_id, Ok(output))
            }
            Some(failure) if record.retries_left > 0 => {
                record.retries_left -= 1;
                record.avoid = engine_id;
                record.engine = None;
                record.state = TaskState::Queued;
                self.queue.push_back(task_id);
                info!(
                    task_id = %task_id,
                    error = %failure,
                    retries_left = record.retries_left,
                    "Task failed, resubmitting"
                );
                None
            }
            Some(failure) => match record.task.recovery.take() {
                Some(recovery) if !record.recovering => {
                    record.recovering = true;
                    record.retries_left = recovery.retries.unwrap_or(self.default_retries);
                    record.task = *recovery;
                    record.avoid = engine_id;
                    record.engine = None;
                    record.state = TaskState::Queued;
                    self.queue.push_back(task_id);
                    info!(task_id = %task_id, error = %failure, "Task failed, running recovery task");
                    None
                }
                _ => {
                    warn!(task_id = %task_id, error = %failure, "Task failed");
                    self.finish(task_id, Err(TaskError::Call(failure)))
                }
            },
        }
    }

    fn collect_output(task: &Task, calls: &[ResolvedCall]) -> TaskOutput {
        let mut output = TaskOutput::default();
        for call in calls {
            match &call.outcome {
                Ok(EngineReply::Executed { stdout, stderr }) => {
                    output.stdout.clone_from(stdout);
                    output.stderr.clone_from(stderr);
                }
                Ok(EngineReply::Pulled { values }) => {
                    output.results = task.pull.iter().cloned().zip(values.iter().cloned()).collect();
                }
                _ => {}
            }
        }
        output
    }

    fn finish(
        &mut self,
        task_id: TaskId,
        outcome: Result<TaskOutput, TaskError>,
    ) -> Option<TaskResult> {
        let record = self.records.get_mut(&task_id)?;
        let result = TaskResult {
            task_id,
            engine_id: record.engine,
            attempts: record.attempts,
            submitted_at: record.submitted_at,
            completed_at: Utc::now(),
            outcome,
        };
        record.state = result.state();
        record.engine = None;
        record.result = Some(result.clone());
        metrics::counter!("controller_tasks_finished_total", "state" => record.state.as_str())
            .increment(1);

        for waiter in self.waiters.remove(&task_id).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
        Some(result)
    }

    /// Looks up a task's result.
    ///
    /// # Errors
    ///
    /// Returns `TaskQueueError::UnknownTask` if no record exists.
    pub fn result(&mut self, task_id: TaskId, block: bool) -> Result<TaskPoll, TaskQueueError> {
        let record = self
            .records
            .get(&task_id)
            .ok_or(TaskQueueError::UnknownTask(task_id))?;
        if let Some(result) = &record.result {
            return Ok(TaskPoll::Ready(result.clone()));
        }
        if !block {
            return Ok(TaskPoll::Pending);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(task_id).or_default().push(tx);
        Ok(TaskPoll::Waiting(rx))
    }

    /// Aborts a task. A queued task fails immediately; a running task fails
    /// when its attempt completes and is not resubmitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown, finished or already
    /// being aborted.
    pub fn abort(&mut self, task_id: TaskId) -> Result<Option<TaskResult>, TaskQueueError> {
        let record = self
            .records
            .get_mut(&task_id)
            .ok_or(TaskQueueError::UnknownTask(task_id))?;
        match record.state {
            TaskState::Completed | TaskState::Failed => Err(TaskQueueError::AlreadyFinished(task_id)),
            _ if record.aborted => Err(TaskQueueError::AlreadyAborted(task_id)),
            TaskState::Queued => {
                self.queue.retain(|queued| *queued != task_id);
                info!(task_id = %task_id, "Queued task aborted");
                Ok(self.finish(task_id, Err(TaskError::Aborted)))
            }
            TaskState::Assigned | TaskState::Running => {
                record.aborted = true;
                info!(task_id = %task_id, "Running task flagged for abort");
                Ok(None)
            }
        }
    }

    /// Drops the record of a finished task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or has not finished.
    pub fn discard(&mut self, task_id: TaskId) -> Result<(), TaskQueueError> {
        let record = self
            .records
            .get(&task_id)
            .ok_or(TaskQueueError::UnknownTask(task_id))?;
        if !record.state.is_terminal() {
            return Err(TaskQueueError::NotFinished(task_id));
        }
        self.records.remove(&task_id);
        Ok(())
    }

    /// State of one task.
    #[must_use]
    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.records.get(&task_id).map(|record| record.state)
    }

    /// Counts of retained tasks per state.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        let mut status = TaskStatus::default();
        for record in self.records.values() {
            match record.state {
                TaskState::Queued => status.queued += 1,
                TaskState::Assigned | TaskState::Running => status.running += 1,
                TaskState::Completed => status.completed += 1,
                TaskState::Failed => status.failed += 1,
            }
        }
        status
    }
}
