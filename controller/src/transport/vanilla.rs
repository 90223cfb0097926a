//! TCP transport. Engines dial in and speak length-prefixed JSON frames.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use super::{attach_stream, TransportError};
use crate::controller::EventSink;
use crate::engine::{worker, Engine};
use crate::protocol::{Bindings, Codec, EngineId};

/// Accepts engine connections on a TCP socket.
#[derive(Debug)]
pub struct VanillaListener {
    listener: TcpListener,
}

impl VanillaListener {
    /// Binds the engine-facing socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts engines forever. Each connection is handshaken on its own
    /// task so a slow engine cannot hold up the others.
    pub async fn serve(self, sink: EventSink, codec: Codec) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
            let sink = sink.clone();
            tokio::spawn(async move {
                match attach_stream(stream, sink, codec).await {
                    Ok(engine_id) => info!(engine_id = %engine_id, peer = %peer, "Engine attached"),
                    Err(e) => warn!(peer = %peer, error = %e, "Engine attach failed"),
                }
            });
        }
    }
}

/// Dials the controller at `addr` and serves `engine` until killed or
/// disconnected.
///
/// # Errors
///
/// Returns an error if the connection or the registration fails.
pub async fn connect_engine(
    addr: impl ToSocketAddrs,
    engine: Engine,
    codec: Codec,
    properties: Bindings,
) -> Result<EngineId, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    worker::serve(stream, engine, codec, properties).await
}
