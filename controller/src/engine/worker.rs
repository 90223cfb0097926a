//! Drives an [`Engine`] over a framed byte stream.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::Engine;
use crate::protocol::{
    Bindings, CallFailure, CallId, Codec, ControllerFrame, EngineFrame, EngineId, EngineRequest,
    FailureKind,
};
use crate::transport::TransportError;

/// Registers `engine` with the controller on the other end of `stream` and
/// answers requests until the controller hangs up or sends `Kill`.
///
/// Returns the ID the controller assigned.
///
/// # Errors
///
/// Returns `Rejected` if the controller refuses the engine, `Handshake` if
/// it answers the registration with anything else, and `Io`/`Codec` for
/// stream failures.
#[instrument(skip_all)]
pub async fn serve<S>(
    stream: S,
    mut engine: Engine,
    codec: Codec,
    properties: Bindings,
) -> Result<EngineId, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let register = codec.encode(&EngineFrame::Register { properties })?;
    codec.write_frame(&mut writer, &register).await?;

    let answer = codec
        .read_frame(&mut reader)
        .await?
        .ok_or_else(|| TransportError::Handshake("controller closed during registration".into()))?;
    let engine_id = match codec.decode::<ControllerFrame>(&answer)? {
        ControllerFrame::Registered { engine_id } => engine_id,
        ControllerFrame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
        ControllerFrame::Request { call_id, .. } => {
            return Err(TransportError::Handshake(format!(
                "expected registration answer, got request {call_id}"
            )))
        }
    };
    engine.set_engine_id(engine_id);
    info!(engine_id = %engine_id, "Engine registered");

    while let Some(payload) = codec.read_frame(&mut reader).await? {
        let (call_id, outcome, killed) = match codec.decode::<ControllerFrame>(&payload) {
            Ok(ControllerFrame::Request { call_id, request }) => {
                let killed = matches!(request, EngineRequest::Kill);
                debug!(engine_id = %engine_id, call_id = %call_id, op = %request.kind(), "Handling request");
                (call_id, engine.handle(request), killed)
            }
            Ok(other) => {
                warn!(engine_id = %engine_id, frame = ?other, "Ignoring unexpected frame");
                continue;
            }
            Err(e) => match salvage_call_id(&payload) {
                Some(call_id) => (call_id, Err(CallFailure::from(e)), false),
                None => {
                    warn!(engine_id = %engine_id, error = %e, "Dropping undecodable frame");
                    continue;
                }
            },
        };

        let reply = match codec.encode(&EngineFrame::Reply { call_id, outcome }) {
            Ok(reply) => reply,
            Err(e) => codec.encode(&EngineFrame::Reply {
                call_id,
                outcome: Err(CallFailure::new(
                    FailureKind::SerializationError,
                    e.to_string(),
                )),
            })?,
        };
        codec.write_frame(&mut writer, &reply).await?;

        if killed {
            info!(engine_id = %engine_id, "Engine killed");
            break;
        }
    }

    let _ = writer.shutdown().await;
    Ok(engine_id)
}

/// Recovers the call ID of a request whose body failed to decode, so the
/// failure can still be reported against the right call.
fn salvage_call_id(payload: &[u8]) -> Option<CallId> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("call_id")?.as_u64().map(CallId::new)
}
