use std::collections::BTreeMap;

use crate::pending::CorrelationError;
use crate::protocol::{CallFailure, CodecError, EngineId, OpKind};
use crate::registry::RegistryError;
use crate::tasks::TaskQueueError;
use crate::transport::TransportError;

/// Errors returned by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Target resolution or registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The target selector resolved to no engines.
    #[error("target selector resolved to no engines")]
    NoEngine,
    /// A payload could not be encoded for the wire.
    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),
    /// A reply could not be correlated with a call.
    #[error("correlation failure: {0}")]
    Correlation(#[from] CorrelationError),
    /// Some engines failed to deliver their part of a gather.
    #[error("gather of '{name}' failed on {} engine(s)", failures.len())]
    GatherIncomplete {
        /// Gathered name.
        name: String,
        /// Per-engine failures.
        failures: BTreeMap<EngineId, CallFailure>,
    },
    /// A gathered value was not a sequence.
    #[error("'{name}' on engine {engine_id} is not a sequence")]
    NotASequence {
        /// Engine holding the value.
        engine_id: EngineId,
        /// Gathered name.
        name: String,
    },
    /// An engine answered with a reply of the wrong kind.
    #[error("engine {engine_id} sent an unexpected reply to {expected}")]
    UnexpectedReply {
        /// Engine that replied.
        engine_id: EngineId,
        /// Operation that was issued.
        expected: OpKind,
    },
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Task lookup or state change failed.
    #[error(transparent)]
    Task(#[from] TaskQueueError),
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The controller is no longer running.
    #[error("controller stopped")]
    Stopped,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ControllerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Stopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ControllerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Stopped
    }
}
