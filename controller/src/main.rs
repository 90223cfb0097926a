use anyhow::Context;
use cluster_controller::engine::Engine;
use cluster_controller::infrastructure::{
    audit, config::Settings, server, telemetry::TelemetryBuilder,
};
use cluster_controller::protocol::Bindings;
use cluster_controller::transport::{spawn_local_engine, TransportKind, VanillaListener};
use cluster_controller::Controller;
use serde_json::Value;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Settings::new().context("Failed to load configuration")?;

    let telemetry = TelemetryBuilder::from_settings(&config.telemetry, env!("CARGO_PKG_VERSION"))
        .init()
        .context("Failed to initialize telemetry")?;
    let metrics = server::install_metrics()?;

    info!(span_export = telemetry.exporting(), "Cluster Controller Starting...");
    let api_addr = config.server_addr()?;
    audit::log_audit(&audit::AuditEvent::ControllerStartup {
        transport: config.transport.kind.to_string(),
        api_addr: api_addr.to_string(),
    });

    let (handle, controller) = Controller::spawn(&config.controller);
    let codec = config.controller.codec();

    let listener_task = match config.transport.kind {
        TransportKind::Vanilla => {
            let listener = VanillaListener::bind(config.transport.engine_listen.as_str())
                .await
                .with_context(|| format!("Failed to bind {}", config.transport.engine_listen))?;
            info!("Engines connect to {}", listener.local_addr()?);
            Some(tokio::spawn(listener.serve(handle.event_sink(), codec)))
        }
        TransportKind::Local => {
            for index in 0..config.transport.local_engines {
                let mut properties = Bindings::new();
                properties.insert("local_index".into(), Value::from(index));
                spawn_local_engine(handle.event_sink(), codec, Engine::default(), properties)
                    .await?;
            }
            info!("Started {} local engines", config.transport.local_engines);
            None
        }
    };

    let app = server::app(handle.clone(), metrics);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::run_server(api_addr, app, shutdown_signal()).await {
            error!("Client API failed: {:?}", e);
        }
    });

    info!("Cluster Controller Initialized. Waiting for shutdown signal...");

    let reason = tokio::select! {
        _ = server_task => "Signal received".to_string(),
        outcome = controller => match outcome {
            Ok(Ok(())) => "Controller stopped".to_string(),
            Ok(Err(e)) => format!("Controller failed: {e}"),
            Err(e) => format!("Controller task failed: {e}"),
        },
    };

    info!("Shutting down: {reason}");
    audit::log_audit(&audit::AuditEvent::ControllerShutdown { reason });
    if let Some(task) = listener_task {
        task.abort();
    }
    let _ = handle.shutdown().await;

    info!("Cluster Controller Shutdown Complete.");
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
