use anyhow::Context;
use cluster_controller::engine::Engine;
use cluster_controller::infrastructure::{config::Settings, telemetry::TelemetryBuilder};
use cluster_controller::transport::vanilla::connect_engine;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Settings::new().context("Failed to load configuration")?;

    let mut telemetry = config.telemetry.clone();
    if telemetry.service_name == "cluster-controller" {
        telemetry.service_name = "cluster-engine".to_string();
    }
    let guard = TelemetryBuilder::from_settings(&telemetry, env!("CARGO_PKG_VERSION"))
        .init()
        .context("Failed to initialize telemetry")?;

    let target = config.engine_target().to_string();
    info!("Cluster Engine connecting to {target}");

    let served = connect_engine(
        target.as_str(),
        Engine::default(),
        config.controller.codec(),
        config.engine.properties.clone(),
    )
    .await
    .with_context(|| format!("Engine session with {target} failed"));
    if let Ok(engine_id) = &served {
        info!(engine_id = %engine_id, "Cluster Engine stopped");
    }
    guard.shutdown();
    served.map(drop)
}
