use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::events::{Command, ControllerEvent, Reply, Ticket};
use crate::error::ControllerError;
use crate::pending::{GroupId, Outcomes};
use crate::protocol::{Bindings, CallId, CallOutcome, ConnectionId, EngineId, EngineRequest};
use crate::registry::{EngineInfo, TargetSelector};
use crate::tasks::{Task, TaskId, TaskPoll, TaskResult, TaskStatus};
use crate::transport::EngineConnection;

async fn call<T>(
    events: &mpsc::UnboundedSender<ControllerEvent>,
    build: impl FnOnce(Reply<T>) -> ControllerEvent,
) -> Result<T, ControllerError> {
    let (tx, rx) = oneshot::channel();
    events.send(build(tx))?;
    rx.await?
}

/// Cloneable client handle on a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl ControllerHandle {
    pub(crate) fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self { events }
    }

    pub(crate) async fn command<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControllerError> {
        call(&self.events, |reply| ControllerEvent::Command(build(reply))).await
    }

    pub(crate) async fn ticket(
        &self,
        build: impl FnOnce(Reply<Ticket>) -> Command,
    ) -> Result<MultiCall, ControllerError> {
        let ticket = self.command(build).await?;
        Ok(MultiCall {
            group: ticket.group,
            engines: ticket.engines,
            outcomes: ticket.outcomes,
            events: self.events.clone(),
        })
    }

    /// Sends `request` to every engine `targets` resolves to and returns
    /// without waiting for replies.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEngine` or `NoEngine` if the selector is stale or
    /// empty, `Serialization` if the request cannot be encoded, and
    /// `Stopped` if the controller is gone.
    pub async fn dispatch(
        &self,
        targets: impl Into<TargetSelector>,
        request: EngineRequest,
    ) -> Result<MultiCall, ControllerError> {
        let selector = targets.into();
        self.ticket(|reply| Command::Dispatch {
            selector,
            request,
            reply,
        })
        .await
    }

    /// Snapshot of every engine slot.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller is gone.
    pub async fn engines(&self) -> Result<Vec<EngineInfo>, ControllerError> {
        self.command(|reply| Command::Engines { reply }).await
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller is gone.
    pub async fn submit(&self, task: Task) -> Result<TaskId, ControllerError> {
        self.command(|reply| Command::SubmitTask { task, reply }).await
    }

    /// Fetches a task's result. With `block` set, waits until the task
    /// finishes; otherwise returns `None` for an unfinished task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or the controller is gone.
    pub async fn result(
        &self,
        task_id: TaskId,
        block: bool,
    ) -> Result<Option<TaskResult>, ControllerError> {
        let poll = self
            .command(|reply| Command::TaskResult {
                task_id,
                block,
                reply,
            })
            .await?;
        match poll {
            TaskPoll::Ready(result) => Ok(Some(result)),
            TaskPoll::Pending => Ok(None),
            TaskPoll::Waiting(rx) => Ok(Some(rx.await?)),
        }
    }

    /// Waits until every listed task has finished and returns their
    /// results in the same order.
    ///
    /// # Errors
    ///
    /// Returns an error if any task is unknown or the controller is gone.
    pub async fn barrier(&self, task_ids: &[TaskId]) -> Result<Vec<TaskResult>, ControllerError> {
        let mut results = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            if let Some(result) = self.result(*task_id, true).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Aborts a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown, finished or already being
    /// aborted.
    pub async fn abort(&self, task_id: TaskId) -> Result<(), ControllerError> {
        self.command(|reply| Command::AbortTask { task_id, reply })
            .await
    }

    /// Drops the record of a finished task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or unfinished.
    pub async fn discard(&self, task_id: TaskId) -> Result<(), ControllerError> {
        self.command(|reply| Command::DiscardTask { task_id, reply })
            .await
    }

    /// Task counts per state.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller is gone.
    pub async fn task_status(&self) -> Result<TaskStatus, ControllerError> {
        self.command(|reply| Command::TaskStatus { reply }).await
    }

    /// Re-runs the scheduling loop.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller is gone.
    pub fn spin(&self) -> Result<(), ControllerError> {
        self.events.send(ControllerEvent::Command(Command::Spin))?;
        Ok(())
    }

    /// Stops the controller and closes every engine connection.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller is already gone.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.command(|reply| Command::Shutdown { reply }).await
    }

    /// Returns `true` while the controller loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// Feed for transports.
    #[must_use]
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            events: self.events.clone(),
        }
    }
}

/// A dispatched multi-target call.
pub struct MultiCall {
    group: GroupId,
    engines: Vec<EngineId>,
    outcomes: oneshot::Receiver<Outcomes>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl MultiCall {
    /// Engines the call went to, ascending.
    #[must_use]
    pub fn engines(&self) -> &[EngineId] {
        &self.engines
    }

    /// Waits until every member call has resolved, successfully or not.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller stopped first.
    pub async fn wait(self) -> Result<Outcomes, ControllerError> {
        Ok(self.outcomes.await?)
    }

    /// Marks every unresolved member `Cancelled` and returns the outcomes.
    /// Engines may still run the operation; their replies are discarded.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the controller stopped first.
    pub async fn cancel(self) -> Result<Outcomes, ControllerError> {
        self.events
            .send(ControllerEvent::Command(Command::Cancel { group: self.group }))?;
        self.wait().await
    }
}

/// Feed of engine connects, replies and disconnects into the controller.
#[derive(Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl EventSink {
    /// Registers a freshly handshaken connection and returns the engine ID.
    /// The controller sends the `Registered` frame on the connection before
    /// answering.
    ///
    /// # Errors
    ///
    /// Returns a registration error, or `Stopped` if the controller is gone.
    pub async fn connect(
        &self,
        connection: Arc<dyn EngineConnection>,
        properties: Bindings,
    ) -> Result<EngineId, ControllerError> {
        call(&self.events, |reply| ControllerEvent::EngineConnected {
            connection,
            properties,
            reply,
        })
        .await
    }

    /// Forwards an engine's reply.
    pub fn reply(
        &self,
        engine_id: EngineId,
        connection_id: ConnectionId,
        call_id: CallId,
        outcome: CallOutcome,
    ) {
        let _ = self.events.send(ControllerEvent::EngineReply {
            engine_id,
            connection_id,
            call_id,
            outcome,
        });
    }

    /// Reports that a connection is gone.
    pub fn disconnect(
        &self,
        engine_id: EngineId,
        connection_id: ConnectionId,
        reason: impl Into<String>,
    ) {
        let _ = self.events.send(ControllerEvent::EngineDisconnected {
            engine_id,
            connection_id,
            reason: reason.into(),
        });
    }
}
