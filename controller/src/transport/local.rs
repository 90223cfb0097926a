//! In-process engines over in-memory pipes.
//!
//! A local engine speaks exactly the framed protocol a remote one does, so
//! the controller cannot tell the two apart.

use tokio::task::JoinHandle;
use tracing::info;

use super::{attach_stream, TransportError};
use crate::controller::EventSink;
use crate::engine::{worker, Engine};
use crate::protocol::{Bindings, Codec, EngineId};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A running in-process engine.
#[derive(Debug)]
pub struct LocalEngine {
    engine_id: EngineId,
    task: JoinHandle<Result<EngineId, TransportError>>,
}

impl LocalEngine {
    /// The ID the controller assigned.
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    /// Whether the engine task has stopped, for example after `Kill`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Severs the pipe without a goodbye, as a crashed engine would.
    pub fn disconnect(self) {
        self.task.abort();
    }
}

/// Starts `engine` on a tokio task and registers it with the controller.
///
/// # Errors
///
/// Returns the handshake or registration error if the controller does not
/// accept the engine.
pub async fn spawn_local_engine(
    sink: EventSink,
    codec: Codec,
    engine: Engine,
    properties: Bindings,
) -> Result<LocalEngine, TransportError> {
    let (controller_side, engine_side) = tokio::io::duplex(PIPE_CAPACITY);
    let task = tokio::spawn(worker::serve(engine_side, engine, codec, properties));

    match attach_stream(controller_side, sink, codec).await {
        Ok(engine_id) => {
            info!(engine_id = %engine_id, "Local engine started");
            Ok(LocalEngine { engine_id, task })
        }
        Err(e) => {
            task.abort();
            Err(e)
        }
    }
}
