use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{Command, ControllerEvent, Reply, Ticket};
use super::handle::ControllerHandle;
use crate::error::ControllerError;
use crate::infrastructure::audit::{log_audit, AuditEvent};
use crate::infrastructure::config::ControllerSettings;
use crate::ops::{partition, ScatterStyle};
use crate::pending::{PendingCallTable, Settled, Waiter};
use crate::protocol::{
    Bindings, CallId, CallOutcome, Codec, ConnectionId, ControllerFrame, EngineId, EngineRequest,
};
use crate::registry::{EngineRegistry, EngineState, PropertyOp, TargetSelector};
use crate::router::{Dispatch, RequestRouter};
use crate::tasks::TaskController;
use crate::transport::{EngineConnection, TransportError};

enum Flow {
    Continue,
    Stop(Reply<()>),
}

/// The controller actor. Build with [`Controller::new`], then drive it with
/// [`Controller::run`] or [`Controller::spawn`].
pub struct Controller {
    registry: EngineRegistry,
    pending: PendingCallTable,
    tasks: TaskController,
    codec: Codec,
    call_timeout: Option<Duration>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    reschedule: bool,
}

impl Controller {
    /// Creates a controller and the handle that feeds it.
    #[must_use]
    pub fn new(settings: &ControllerSettings) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            registry: EngineRegistry::new(),
            pending: PendingCallTable::new(),
            tasks: TaskController::new(settings.default_retries),
            codec: settings.codec(),
            call_timeout: settings.call_timeout(),
            events: rx,
            reschedule: false,
        };
        (controller, ControllerHandle::new(tx))
    }

    /// Creates a controller and runs it on a new tokio task.
    #[must_use]
    pub fn spawn(
        settings: &ControllerSettings,
    ) -> (ControllerHandle, JoinHandle<Result<(), ControllerError>>) {
        let (controller, handle) = Self::new(settings);
        (handle, tokio::spawn(controller.run()))
    }

    /// Runs the event loop until shutdown, until every handle is dropped,
    /// or until a correlation bug is detected.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Correlation` if an engine reply cannot be
    /// matched to a call.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!(
            call_timeout_ms = ?self.call_timeout.map(|t| t.as_millis()),
            max_message_size = self.codec.max_message_size(),
            "Controller started"
        );
        loop {
            let deadline = self.pending.next_deadline();
            let flow = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => Ok(Flow::Stop(oneshot::channel().0)),
                },
                () = sleep_until(deadline) => {
                    let settled = self.pending.expire(Instant::now());
                    self.settle(settled);
                    Ok(Flow::Continue)
                }
            };

            match flow {
                Ok(Flow::Continue) => self.drain_schedule(),
                Ok(Flow::Stop(reply)) => {
                    self.close_all();
                    info!("Controller stopped");
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Fatal controller error, stopping");
                    self.close_all();
                    return Err(e);
                }
            }
        }
    }

    fn handle_event(&mut self, event: ControllerEvent) -> Result<Flow, ControllerError> {
        match event {
            ControllerEvent::Command(command) => return Ok(self.handle_command(command)),
            ControllerEvent::EngineConnected {
                connection,
                properties,
                reply,
            } => {
                let _ = reply.send(self.on_connect(connection, properties));
            }
            ControllerEvent::EngineReply {
                engine_id,
                connection_id,
                call_id,
                outcome,
            } => self.on_reply(engine_id, connection_id, call_id, outcome)?,
            ControllerEvent::EngineDisconnected {
                engine_id,
                connection_id,
                reason,
            } => {
                if self.registry.owns(engine_id, connection_id)
                    && self.registry.state(engine_id) != Some(EngineState::Disconnected)
                {
                    self.lose_engine(engine_id, &reason);
                } else {
                    debug!(engine_id = %engine_id, "Ignoring disconnect of a stale connection");
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Dispatch {
                selector,
                request,
                reply,
            } => {
                let (tx, rx) = oneshot::channel();
                let dispatch = self.router().dispatch(&selector, &request, Waiter::Client(tx));
                self.answer_dispatch(dispatch, rx, reply);
            }
            Command::Scatter {
                selector,
                name,
                values,
                style,
                reply,
            } => {
                let (tx, rx) = oneshot::channel();
                let dispatch = self.scatter(&selector, &name, &values, style, Waiter::Client(tx));
                self.answer_dispatch(dispatch, rx, reply);
            }
            Command::Cancel { group } => {
                debug!(group = %group, "Cancelling multi-call");
                let settled = self.pending.cancel(group);
                self.settle(settled);
            }
            Command::Engines { reply } => {
                let _ = reply.send(Ok(self.registry.snapshot()));
            }
            Command::Properties {
                selector,
                op,
                reply,
            } => {
                let _ = reply.send(self.properties(&selector, &op));
            }
            Command::SubmitTask { task, reply } => {
                let task_id = self.tasks.submit(task);
                let _ = reply.send(Ok(task_id));
                self.reschedule = true;
            }
            Command::TaskResult {
                task_id,
                block,
                reply,
            } => {
                let _ = reply.send(self.tasks.result(task_id, block).map_err(Into::into));
            }
            Command::AbortTask { task_id, reply } => {
                let result = self.tasks.abort(task_id).map(|_| ()).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::DiscardTask { task_id, reply } => {
                let _ = reply.send(self.tasks.discard(task_id).map_err(Into::into));
            }
            Command::TaskStatus { reply } => {
                let _ = reply.send(Ok(self.tasks.status()));
            }
            Command::Spin => self.reschedule = true,
            Command::Shutdown { reply } => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    fn router(&mut self) -> RequestRouter<'_> {
        RequestRouter::new(
            &mut self.registry,
            &mut self.pending,
            self.codec,
            self.call_timeout,
        )
    }

    fn scatter(
        &mut self,
        selector: &TargetSelector,
        name: &str,
        values: &[Value],
        style: ScatterStyle,
        waiter: Waiter,
    ) -> Result<Dispatch, ControllerError> {
        let mut router = self.router();
        let engines = router.resolve(selector)?;
        let parts = partition(values, engines.len());
        let targets = engines
            .into_iter()
            .zip(parts)
            .map(|(engine_id, part)| {
                let bindings = style.bindings(name, part);
                (engine_id, EngineRequest::Push { bindings })
            })
            .collect();
        router.dispatch_each(targets, waiter)
    }

    fn properties(
        &mut self,
        selector: &TargetSelector,
        op: &PropertyOp,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError> {
        let engines = self.router().resolve(selector)?;
        let mut properties = BTreeMap::new();
        for engine_id in engines {
            properties.insert(engine_id, self.registry.apply_properties(engine_id, op)?);
        }
        if op.is_update() {
            info!(targets = %selector, "Engine properties updated");
            self.reschedule = true;
        }
        Ok(properties)
    }

    fn answer_dispatch(
        &mut self,
        dispatch: Result<Dispatch, ControllerError>,
        outcomes: oneshot::Receiver<crate::pending::Outcomes>,
        reply: Reply<Ticket>,
    ) {
        match dispatch {
            Ok(dispatch) => {
                let _ = reply.send(Ok(Ticket {
                    group: dispatch.group,
                    engines: dispatch.engines,
                    outcomes,
                }));
                self.settle(dispatch.settled);
                for (engine_id, reason) in dispatch.lost {
                    self.lose_engine(engine_id, &reason);
                }
            }
            Err(e) => {
                debug!(error = %e, "Dispatch refused");
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_connect(
        &mut self,
        connection: Arc<dyn EngineConnection>,
        properties: Bindings,
    ) -> Result<EngineId, ControllerError> {
        let connection_id = connection.connection_id();
        let engine_id = self
            .registry
            .register(Arc::clone(&connection), properties)?;

        let accepted = self
            .codec
            .encode(&ControllerFrame::Registered { engine_id })
            .map_err(TransportError::from)
            .and_then(|frame| connection.send(frame));
        if let Err(e) = accepted {
            warn!(engine_id = %engine_id, error = %e, "Could not acknowledge registration");
            let _ = self.registry.unregister(engine_id);
            self.registry.release(engine_id);
            return Err(e.into());
        }

        self.registry.activate(engine_id)?;
        log_audit(&AuditEvent::EngineRegistered {
            engine_id: engine_id.as_u32(),
            connection_id: connection_id.to_string(),
        });
        self.record_engine_gauge();
        self.reschedule = true;
        Ok(engine_id)
    }

    fn on_reply(
        &mut self,
        engine_id: EngineId,
        connection_id: ConnectionId,
        call_id: CallId,
        outcome: CallOutcome,
    ) -> Result<(), ControllerError> {
        if !self.registry.owns(engine_id, connection_id) || !self.registry.is_live(engine_id) {
            debug!(engine_id = %engine_id, call_id = %call_id, "Dropping reply from a stale connection");
            return Ok(());
        }
        if outcome.is_ok() {
            self.registry.set_suspect(engine_id, false);
        }
        let settled = self.pending.resolve(engine_id, call_id, outcome)?;
        self.settle(settled);
        Ok(())
    }

    fn lose_engine(&mut self, engine_id: EngineId, reason: &str) {
        if self.registry.unregister(engine_id).is_err() {
            return;
        }
        warn!(engine_id = %engine_id, reason = %reason, "Engine lost");
        log_audit(&AuditEvent::EngineLost {
            engine_id: engine_id.as_u32(),
            reason: reason.to_string(),
        });
        self.record_engine_gauge();
        let settled = self.pending.force_fail(engine_id, reason);
        self.settle(settled);
        self.reap(engine_id);
    }

    /// Frees a disconnected slot once nothing references it any more.
    fn reap(&mut self, engine_id: EngineId) {
        if self.registry.state(engine_id) == Some(EngineState::Disconnected)
            && self.pending.outstanding(engine_id) == 0
        {
            self.registry.release(engine_id);
        }
    }

    fn settle(&mut self, settled: Settled) {
        if settled.is_empty() {
            return;
        }
        for engine_id in &settled.engines {
            self.registry.mark_done(*engine_id);
        }
        for engine_id in &settled.timed_out {
            self.registry.set_suspect(*engine_id, true);
        }
        for group in settled.completed {
            for call in &group.calls {
                if let Err(failure) = &call.outcome {
                    metrics::counter!(
                        "controller_call_failures_total",
                        "kind" => failure.kind.as_str()
                    )
                    .increment(1);
                }
            }
            match group.waiter {
                Waiter::Client(tx) => {
                    let outcomes = group
                        .calls
                        .iter()
                        .map(|call| (call.engine_id, call.outcome.clone()))
                        .collect();
                    if tx.send(outcomes).is_err() {
                        debug!(group = %group.id, "Multi-call handle dropped before completion");
                    }
                }
                Waiter::Task(task_id) => {
                    if let Some(result) = self.tasks.on_attempt_complete(task_id, &group.calls) {
                        debug!(task_id = %task_id, state = %result.state(), "Task finished");
                    }
                }
            }
        }
        let mut engines = settled.engines;
        engines.sort_unstable();
        engines.dedup();
        for engine_id in engines {
            self.reap(engine_id);
        }
        self.reschedule = true;
    }

    fn drain_schedule(&mut self) {
        while self.reschedule {
            self.reschedule = false;
            self.schedule_tasks();
        }
    }

    fn schedule_tasks(&mut self) {
        let assignments = self.tasks.schedule(self.registry.idle());
        for assignment in assignments {
            let task_id = assignment.task_id;
            let engine_id = assignment.engine_id;
            let targets = assignment
                .requests
                .into_iter()
                .map(|request| (engine_id, request))
                .collect();
            match self.router().dispatch_each(targets, Waiter::Task(task_id)) {
                Ok(dispatch) => {
                    self.tasks.mark_running(task_id);
                    self.settle(dispatch.settled);
                    for (engine_id, reason) in dispatch.lost {
                        self.lose_engine(engine_id, &reason);
                    }
                }
                Err(ControllerError::Serialization(e)) => {
                    self.tasks.fail_dispatch(task_id, e.into());
                }
                Err(e) => {
                    warn!(task_id = %task_id, engine_id = %engine_id, error = %e, "Task dispatch refused, requeueing");
                    self.tasks.requeue(task_id);
                }
            }
        }
    }

    fn record_engine_gauge(&self) {
        let live = u32::try_from(self.registry.live_count()).unwrap_or(u32::MAX);
        metrics::gauge!("controller_engines_registered").set(f64::from(live));
    }

    fn close_all(&mut self) {
        for engine_id in self.registry.connected() {
            if let Some(connection) = self.registry.connection(engine_id) {
                connection.close();
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
