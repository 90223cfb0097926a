//! Engine-facing transports.
//!
//! A transport turns a byte stream into an [`EngineConnection`] plus a feed
//! of replies and disconnects into the controller's event queue. Every
//! stream-based transport shares the same framing: each connection has a
//! writer task fed by an unbounded channel, which keeps calls to one
//! engine in dispatch order, and a reader task that forwards replies.

pub mod local;
pub mod vanilla;

pub use local::{spawn_local_engine, LocalEngine};
pub use vanilla::{connect_engine, VanillaListener};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::controller::EventSink;
use crate::protocol::{Codec, CodecError, ConnectionId, ControllerFrame, EngineFrame, EngineId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The registration handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The controller refused the engine.
    #[error("registration rejected: {0}")]
    Rejected(String),
    /// Framing or encoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which engine transport the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Engines dial in over TCP with length-prefixed JSON frames.
    #[default]
    Vanilla,
    /// Engines run in-process over in-memory pipes.
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vanilla => f.write_str("vanilla"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// The controller's handle on one engine connection.
///
/// `send` must not block: it queues the frame and returns. Frames queued
/// on one connection reach the engine in the order they were sent.
pub trait EngineConnection: Send + Sync {
    /// Stable identity of this connection.
    fn connection_id(&self) -> ConnectionId;

    /// Queues an encoded [`ControllerFrame`] for delivery.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the connection is gone.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Closes the connection once queued frames are flushed.
    fn close(&self);
}

enum Outbound {
    Frame(Bytes),
    Close,
}

struct StreamConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl EngineConnection for StreamConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Runs the registration handshake on `stream` and wires the connection
/// into the controller. Returns the assigned engine ID.
///
/// # Errors
///
/// Returns an error if the engine does not open with a `Register` frame,
/// the stream fails, or the controller refuses the engine.
pub async fn attach_stream<S>(
    stream: S,
    sink: EventSink,
    codec: Codec,
) -> Result<EngineId, TransportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, codec.read_frame(&mut reader))
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for registration".into()))??
        .ok_or_else(|| TransportError::Handshake("closed before registering".into()))?;
    let properties = match codec.decode::<EngineFrame>(&first)? {
        EngineFrame::Register { properties } => properties,
        EngineFrame::Reply { call_id, .. } => {
            return Err(TransportError::Handshake(format!(
                "expected registration, got reply to call {call_id}"
            )));
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(StreamConnection {
        id: ConnectionId::generate(),
        outbound: outbound_tx,
    });
    let connection_id = connection.id;
    tokio::spawn(write_loop(writer, outbound_rx, codec, connection_id));

    let engine_id = match sink
        .connect(Arc::clone(&connection) as Arc<dyn EngineConnection>, properties)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            let reason = e.to_string();
            if let Ok(frame) = codec.encode(&ControllerFrame::Rejected {
                reason: reason.clone(),
            }) {
                let _ = connection.send(frame);
            }
            connection.close();
            return Err(TransportError::Rejected(reason));
        }
    };

    tokio::spawn(read_loop(reader, sink, codec, engine_id, connection_id));
    Ok(engine_id)
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    codec: Codec,
    connection_id: ConnectionId,
) where
    S: AsyncWrite,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(e) = codec.write_frame(&mut writer, &frame).await {
                    warn!(connection_id = %connection_id, error = %e, "Write failed, closing connection");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    debug!(connection_id = %connection_id, "Writer stopped");
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    sink: EventSink,
    codec: Codec,
    engine_id: EngineId,
    connection_id: ConnectionId,
) where
    S: AsyncRead,
{
    let reason = loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(payload)) => match codec.decode::<EngineFrame>(&payload) {
                Ok(EngineFrame::Reply { call_id, outcome }) => {
                    sink.reply(engine_id, connection_id, call_id, outcome);
                }
                Ok(EngineFrame::Register { .. }) => {
                    break "protocol violation: repeated registration".to_string();
                }
                Err(e) => break format!("undecodable frame: {e}"),
            },
            Ok(None) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    debug!(engine_id = %engine_id, reason = %reason, "Reader stopped");
    sink.disconnect(engine_id, connection_id, reason);
}
