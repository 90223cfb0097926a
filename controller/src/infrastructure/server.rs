use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;

use crate::api;
use crate::controller::ControllerHandle;

async fn health_check() -> &'static str {
    "OK"
}

/// Ready once the controller loop answers; reports the live engine count.
async fn readiness(State(handle): State<ControllerHandle>) -> (StatusCode, Json<Value>) {
    match handle.engines().await {
        Ok(engines) => {
            let live = engines
                .iter()
                .filter(|engine| engine.state == crate::registry::EngineState::Registered)
                .count();
            (StatusCode::OK, Json(json!({ "status": "ready", "engines": live })))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

/// Installs the global Prometheus recorder.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// The control plane plus the client API.
pub fn app(handle: ControllerHandle, metrics: PrometheusHandle) -> Router {
    let control_plane = Router::new()
        .route("/health/live", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(move || std::future::ready(metrics.render())));

    control_plane.merge(api::routes()).with_state(handle)
}

/// Serves `app` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters an error while running.
pub async fn run_server(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Client API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
