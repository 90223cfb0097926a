//! Inputs of the controller actor.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::ControllerError;
use crate::ops::ScatterStyle;
use crate::pending::{GroupId, Outcomes};
use crate::protocol::{Bindings, CallId, CallOutcome, ConnectionId, EngineId, EngineRequest};
use crate::registry::{EngineInfo, PropertyOp, TargetSelector};
use crate::tasks::{Task, TaskId, TaskPoll, TaskStatus};
use crate::transport::EngineConnection;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

/// What a client gets back from a successful dispatch.
pub(crate) struct Ticket {
    pub(crate) group: GroupId,
    pub(crate) engines: Vec<EngineId>,
    pub(crate) outcomes: oneshot::Receiver<Outcomes>,
}

pub(crate) enum Command {
    Dispatch {
        selector: TargetSelector,
        request: EngineRequest,
        reply: Reply<Ticket>,
    },
    Scatter {
        selector: TargetSelector,
        name: String,
        values: Vec<Value>,
        style: ScatterStyle,
        reply: Reply<Ticket>,
    },
    Cancel {
        group: GroupId,
    },
    Engines {
        reply: Reply<Vec<EngineInfo>>,
    },
    Properties {
        selector: TargetSelector,
        op: PropertyOp,
        reply: Reply<BTreeMap<EngineId, Bindings>>,
    },
    SubmitTask {
        task: Task,
        reply: Reply<TaskId>,
    },
    TaskResult {
        task_id: TaskId,
        block: bool,
        reply: Reply<TaskPoll>,
    },
    AbortTask {
        task_id: TaskId,
        reply: Reply<()>,
    },
    DiscardTask {
        task_id: TaskId,
        reply: Reply<()>,
    },
    TaskStatus {
        reply: Reply<TaskStatus>,
    },
    Spin,
    Shutdown {
        reply: Reply<()>,
    },
}

pub(crate) enum ControllerEvent {
    Command(Command),
    EngineConnected {
        connection: Arc<dyn EngineConnection>,
        properties: Bindings,
        reply: Reply<EngineId>,
    },
    EngineReply {
        engine_id: EngineId,
        connection_id: ConnectionId,
        call_id: CallId,
        outcome: CallOutcome,
    },
    EngineDisconnected {
        engine_id: EngineId,
        connection_id: ConnectionId,
        reason: String,
    },
}
