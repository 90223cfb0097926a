//! Target resolution and request fan-out.
//!
//! The router is a short-lived view over the registry and the pending
//! table, built by the controller actor for each dispatch. Every request is
//! encoded before anything is sent, so an unencodable payload leaves no
//! pending state behind.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::pending::{GroupId, PendingCallTable, Settled, Waiter};
use crate::protocol::{
    CallFailure, CallId, Codec, ControllerFrame, EngineId, EngineRequest, FailureKind,
};
use crate::registry::{EngineRegistry, TargetSelector};

/// Result of a successful fan-out.
#[derive(Debug)]
pub struct Dispatch {
    /// Group tracking the dispatched calls.
    pub group: GroupId,
    /// Engines the calls went to, ascending.
    pub engines: Vec<EngineId>,
    /// Calls resolved during dispatch because their send failed.
    pub settled: Settled,
    /// Engines whose connection refused a frame, with the reason.
    pub lost: Vec<(EngineId, String)>,
}

/// Fans requests out to engines and registers the pending calls.
pub struct RequestRouter<'a> {
    registry: &'a mut EngineRegistry,
    pending: &'a mut PendingCallTable,
    codec: Codec,
    call_timeout: Option<Duration>,
}

impl<'a> RequestRouter<'a> {
    /// Creates a router over the controller's state.
    pub fn new(
        registry: &'a mut EngineRegistry,
        pending: &'a mut PendingCallTable,
        codec: Codec,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            pending,
            codec,
            call_timeout,
        }
    }

    /// Resolves a selector to a non-empty, ascending set of live engines.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEngine` for a stale ID and `NoEngine` for an empty
    /// result.
    pub fn resolve(&self, selector: &TargetSelector) -> Result<Vec<EngineId>, ControllerError> {
        let engines = self.registry.resolve(selector)?;
        if engines.is_empty() {
            return Err(ControllerError::NoEngine);
        }
        Ok(engines)
    }

    /// Sends `request` to every engine `selector` resolves to.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector is stale or empty, or if the
    /// request cannot be encoded.
    pub fn dispatch(
        &mut self,
        selector: &TargetSelector,
        request: &EngineRequest,
        waiter: Waiter,
    ) -> Result<Dispatch, ControllerError> {
        let targets = self
            .resolve(selector)?
            .into_iter()
            .map(|id| (id, request.clone()))
            .collect();
        self.dispatch_each(targets, waiter)
    }

    /// Sends an individual request to each listed engine as one group.
    /// Requests for the same engine are delivered in list order.
    ///
    /// # Errors
    ///
    /// Returns `NoEngine` for an empty list, `UnknownEngine` if a target is
    /// not live, and `Serialization` if any request cannot be encoded.
    pub fn dispatch_each(
        &mut self,
        targets: Vec<(EngineId, EngineRequest)>,
        waiter: Waiter,
    ) -> Result<Dispatch, ControllerError> {
        if targets.is_empty() {
            return Err(ControllerError::NoEngine);
        }
        if let Some((id, _)) = targets.iter().find(|(id, _)| !self.registry.is_live(*id)) {
            return Err(crate::registry::RegistryError::UnknownEngine(*id).into());
        }

        let mut encoded = Vec::with_capacity(targets.len());
        for (engine_id, request) in targets {
            let call_id = self.pending.allocate_call_id();
            let kind = request.kind();
            let frame = self
                .codec
                .encode(&ControllerFrame::Request { call_id, request })?;
            encoded.push((engine_id, call_id, kind, frame));
        }

        let deadline = self.call_timeout.map(|timeout| Instant::now() + timeout);
        let group = self.pending.open_group(waiter);
        for (engine_id, call_id, kind, _) in &encoded {
            self.pending
                .insert(group, *call_id, *engine_id, *kind, deadline);
            self.registry.mark_busy(*engine_id);
        }

        let mut engines: Vec<EngineId> = encoded.iter().map(|(id, ..)| *id).collect();
        engines.sort_unstable();
        engines.dedup();

        let mut settled = Settled::default();
        let mut lost: Vec<(EngineId, String)> = Vec::new();
        for (engine_id, call_id, kind, frame) in encoded {
            metrics::counter!("controller_calls_dispatched_total", "op" => kind.to_string())
                .increment(1);
            let sent = match self.registry.connection(engine_id) {
                Some(connection) => connection.send(frame).map_err(|e| e.to_string()),
                None => Err("engine has no connection".to_string()),
            };
            match sent {
                Ok(()) => {
                    debug!(engine_id = %engine_id, call_id = %call_id, op = %kind, "Call dispatched");
                }
                Err(reason) => {
                    warn!(engine_id = %engine_id, call_id = %call_id, reason = %reason, "Send failed");
                    settled.merge(self.fail_send(engine_id, call_id, &reason)?);
                    if !lost.iter().any(|(id, _)| *id == engine_id) {
                        lost.push((engine_id, reason));
                    }
                }
            }
        }

        Ok(Dispatch {
            group,
            engines,
            settled,
            lost,
        })
    }

    fn fail_send(
        &mut self,
        engine_id: EngineId,
        call_id: CallId,
        reason: &str,
    ) -> Result<Settled, ControllerError> {
        let failure = CallFailure::new(FailureKind::EngineLost, reason);
        Ok(self.pending.resolve(engine_id, call_id, Err(failure))?)
    }
}
