//! Wire types exchanged between the controller and its engines.
//!
//! Values crossing the wire are `serde_json::Value`s. The controller never
//! inspects engine-side values beyond moving them between calls.

pub mod codec;

pub use codec::{Codec, CodecError, DEFAULT_MAX_MESSAGE_SIZE};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A mapping of names to values, as pushed into or pulled from a namespace.
pub type Bindings = serde_json::Map<String, Value>;

/// Stable identifier of a registered engine.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(u32);

impl EngineId {
    /// Creates an engine ID from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EngineId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Identifier of one in-flight call. Monotonic and never reused.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Creates a call ID from its raw value.
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

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transport connection, assigned by the transport.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generates a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation kinds understood by engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Run code in the persistent namespace.
    Execute,
    /// Bind values into the namespace.
    Push,
    /// Read values out of the namespace.
    Pull,
    /// Clear user bindings.
    Reset,
    /// List user bindings.
    Keys,
    /// Read an entry of the execution history.
    GetResult,
    /// Shut the engine down.
    Kill,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Execute => "execute",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Reset => "reset",
            Self::Keys => "keys",
            Self::GetResult => "get_result",
            Self::Kill => "kill",
        };
        f.write_str(name)
    }
}

/// A request sent to one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineRequest {
    /// Run `code` in the engine's namespace.
    Execute {
        /// Source to run.
        code: String,
    },
    /// Bind every entry of `bindings`.
    Push {
        /// Names and values to bind.
        bindings: Bindings,
    },
    /// Read the values bound to `names`, in order.
    Pull {
        /// Names to read.
        names: Vec<String>,
    },
    /// Clear bindings created during the session.
    Reset,
    /// List the names bound during the session.
    Keys,
    /// Read one entry of the engine's execution history.
    GetResult {
        /// History position; the latest execution when absent.
        #[serde(default)]
        index: Option<usize>,
    },
    /// Reply and then shut down.
    Kill,
}

impl EngineRequest {
    /// Returns the operation kind of this request.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Execute { .. } => OpKind::Execute,
            Self::Push { .. } => OpKind::Push,
            Self::Pull { .. } => OpKind::Pull,
            Self::Reset => OpKind::Reset,
            Self::Keys => OpKind::Keys,
            Self::GetResult { .. } => OpKind::GetResult,
            Self::Kill => OpKind::Kill,
        }
    }
}

/// A successful reply from one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum EngineReply {
    /// Code ran; captured output streams.
    Executed {
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Bindings were stored.
    Pushed,
    /// Values for the requested names, in request order.
    Pulled {
        /// Pulled values.
        values: Vec<Value>,
    },
    /// Session bindings were cleared.
    Reset,
    /// Names bound in the session namespace.
    Keys {
        /// Sorted binding names.
        names: Vec<String>,
    },
    /// One entry of the execution history.
    ExecutionResult {
        /// Position in the history, counted from zero.
        number: usize,
        /// Code that ran.
        code: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// The engine is shutting down.
    Killed,
}

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine disconnected before replying.
    EngineLost,
    /// The call's deadline elapsed.
    Timeout,
    /// The caller cancelled the call.
    Cancelled,
    /// A pulled name is not bound on the engine.
    NameError,
    /// The engine failed to run the code.
    ExecutionError,
    /// No execution history entry exists at the requested position.
    IndexError,
    /// The payload could not cross the wire.
    SerializationError,
}

impl FailureKind {
    /// Returns the label used for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineLost => "engine_lost",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NameError => "name_error",
            Self::ExecutionError => "execution_error",
            Self::IndexError => "index_error",
            Self::SerializationError => "serialization_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call, as recorded in the caller's outcome mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct CallFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub detail: String,
}

impl CallFailure {
    /// Creates a failure of the given kind.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// The outcome of one call against one engine.
pub type CallOutcome = Result<EngineReply, CallFailure>;

/// Frames the controller sends to an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerFrame {
    /// Registration accepted.
    Registered {
        /// The ID assigned to the engine.
        engine_id: EngineId,
    },
    /// Registration refused.
    Rejected {
        /// Why the engine was refused.
        reason: String,
    },
    /// A call to run.
    Request {
        /// Correlation ID to echo in the reply.
        call_id: CallId,
        /// The operation.
        request: EngineRequest,
    },
}

/// Frames an engine sends to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineFrame {
    /// Registration handshake, the first frame on every connection.
    Register {
        /// Free-form engine properties.
        #[serde(default)]
        properties: Bindings,
    },
    /// The outcome of a previously received request.
    Reply {
        /// The request's correlation ID.
        call_id: CallId,
        /// The outcome.
        outcome: CallOutcome,
    },
}
