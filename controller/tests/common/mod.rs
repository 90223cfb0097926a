//! Shared helpers for controller integration tests.
//!
//! A [`Cluster`] runs a controller on the test runtime with in-process
//! engines. [`SilentEngine`] registers through the raw event sink and never
//! answers, so tests can script replies and disconnects by hand.

#![allow(dead_code)]

use bytes::Bytes;
use cluster_controller::engine::Engine;
use cluster_controller::infrastructure::config::ControllerSettings;
use cluster_controller::protocol::{
    Bindings, CallId, CallOutcome, Codec, ConnectionId, ControllerFrame, EngineId, EngineRequest,
};
use cluster_controller::registry::EngineState;
use cluster_controller::transport::{
    spawn_local_engine, EngineConnection, LocalEngine, TransportError,
};
use cluster_controller::{Controller, ControllerError, ControllerHandle, EventSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A controller plus the local engines attached to it.
pub struct Cluster {
    pub handle: ControllerHandle,
    pub controller: JoinHandle<Result<(), ControllerError>>,
    pub engines: Vec<LocalEngine>,
    codec: Codec,
}

impl Cluster {
    /// Starts a controller with default settings and `engines` local engines.
    pub async fn start(engines: usize) -> Self {
        Self::with_settings(ControllerSettings::default(), engines).await
    }

    /// Starts a controller with `settings` and `engines` local engines.
    pub async fn with_settings(settings: ControllerSettings, engines: usize) -> Self {
        let (handle, controller) = Controller::spawn(&settings);
        let mut cluster = Self {
            handle,
            controller,
            engines: Vec::new(),
            codec: settings.codec(),
        };
        for _ in 0..engines {
            cluster.add_engine().await;
        }
        cluster
    }

    /// Attaches one more local engine and returns its ID.
    pub async fn add_engine(&mut self) -> EngineId {
        self.add_engine_with(Bindings::new()).await
    }

    /// Attaches a local engine announcing `properties`.
    pub async fn add_engine_with(&mut self, properties: Bindings) -> EngineId {
        let engine = spawn_local_engine(
            self.handle.event_sink(),
            self.codec,
            Engine::default(),
            properties,
        )
        .await
        .unwrap();
        let id = engine.engine_id();
        self.engines.push(engine);
        id
    }

    /// Registers an engine that never replies on its own.
    pub async fn add_silent(&self) -> SilentEngine {
        SilentEngine::connect(self.handle.event_sink()).await
    }

    /// Waits until the registry reports exactly `count` live engines.
    pub async fn wait_for_live(&self, count: usize) {
        wait_for_live(&self.handle, count).await;
    }
}

/// Waits until `handle` reports exactly `count` live engines.
pub async fn wait_for_live(handle: &ControllerHandle, count: usize) {
    for _ in 0..200 {
        let live = handle
            .engines()
            .await
            .unwrap()
            .iter()
            .filter(|engine| engine.state == EngineState::Registered)
            .count();
        if live == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {count} live engines");
}

/// Connection that records every frame and delivers nothing.
pub struct RecordingConnection {
    id: ConnectionId,
    frames: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl EngineConnection for RecordingConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// An engine driven by hand through the event sink.
pub struct SilentEngine {
    pub engine_id: EngineId,
    pub connection: Arc<RecordingConnection>,
    sink: EventSink,
}

impl SilentEngine {
    /// Registers a new silent engine.
    pub async fn connect(sink: EventSink) -> Self {
        let connection = Arc::new(RecordingConnection {
            id: ConnectionId::generate(),
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let engine_id = sink
            .connect(
                Arc::clone(&connection) as Arc<dyn EngineConnection>,
                Bindings::new(),
            )
            .await
            .unwrap();
        Self {
            engine_id,
            connection,
            sink,
        }
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<(CallId, EngineRequest)> {
        let codec = Codec::default();
        self.connection
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match codec.decode::<ControllerFrame>(frame).unwrap() {
                ControllerFrame::Request { call_id, request } => Some((call_id, request)),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<(CallId, EngineRequest)> {
        for _ in 0..200 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine {} never received {count} requests", self.engine_id);
    }

    /// Sends a reply as if the engine had answered.
    pub fn reply(&self, call_id: CallId, outcome: CallOutcome) {
        self.sink
            .reply(self.engine_id, self.connection.id, call_id, outcome);
    }

    /// Reports the connection as lost.
    pub fn disconnect(&self, reason: &str) {
        self.sink
            .disconnect(self.engine_id, self.connection.id, reason);
    }

    /// Whether the controller closed the connection.
    pub fn is_closed(&self) -> bool {
        self.connection.closed.load(Ordering::SeqCst)
    }
}
