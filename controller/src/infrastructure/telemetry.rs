use anyhow::{Context, Result};
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::config::TelemetrySettings;

/// Builder for the process-wide tracing subscriber and OTLP exporter.
pub struct TelemetryBuilder {
    service_name: String,
    service_version: String,
    otlp_endpoint: Option<String>,
    log_level: String,
    sampling_ratio: f64,
}

/// Keeps the span exporter alive. Call [`TelemetryGuard::shutdown`] before
/// exiting so batched spans are flushed.
#[must_use = "dropping the guard does not flush pending spans"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are exported.
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }

    /// Flushes and stops the span exporter.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "Failed to flush spans");
            }
        }
    }
}

impl TelemetryBuilder {
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            sampling_ratio: 1.0,
        }
    }

    /// Applies the telemetry section of the configuration.
    #[must_use]
    pub fn from_settings(settings: &TelemetrySettings, service_version: impl Into<String>) -> Self {
        let builder = Self::new(settings.service_name.clone(), service_version)
            .with_log_level(settings.log_level.clone())
            .with_sampling_ratio(settings.sampling_ratio);
        match &settings.otlp_endpoint {
            Some(endpoint) => builder.with_tracing(endpoint.clone()),
            None => builder,
        }
    }

    #[must_use]
    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    #[must_use]
    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio;
        self
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_attributes([
                KeyValue::new(resource::SERVICE_NAME, self.service_name.clone()),
                KeyValue::new(resource::SERVICE_VERSION, self.service_version.clone()),
            ])
            .build()
    }

    fn sampler(&self) -> Sampler {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(self.sampling_ratio)))
    }

    fn tracer_provider(&self, endpoint: &str) -> Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .with_context(|| format!("Failed to build OTLP span exporter for {endpoint}"))?;

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(self.resource())
            .with_sampler(self.sampler())
            .build())
    }

    /// Installs the JSON log layer and, when an endpoint is configured,
    /// span export over OTLP.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or a global
    /// subscriber is already installed.
    pub fn init(self) -> Result<TelemetryGuard> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));
        let fmt_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed();
        let registry = Registry::default().with(env_filter).with(fmt_layer);

        let Some(endpoint) = self.otlp_endpoint.as_deref() else {
            registry.try_init().context("Failed to init subscriber")?;
            return Ok(TelemetryGuard { provider: None });
        };

        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = self.tracer_provider(endpoint)?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let tracer = provider.tracer(self.service_name.clone());

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .context("Failed to init subscriber")?;
        Ok(TelemetryGuard {
            provider: Some(provider),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_carry_into_builder() {
        let settings = TelemetrySettings {
            otlp_endpoint: Some("http://collector:4317".into()),
            sampling_ratio: 0.25,
            ..TelemetrySettings::default()
        };
        let builder = TelemetryBuilder::from_settings(&settings, "1.2.3");
        assert_eq!(builder.service_name, "cluster-controller");
        assert_eq!(builder.service_version, "1.2.3");
        assert_eq!(builder.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert!(matches!(builder.sampler(), Sampler::ParentBased(_)));
    }

    #[test]
    fn no_endpoint_means_no_export() {
        let builder = TelemetryBuilder::from_settings(&TelemetrySettings::default(), "0.1.0");
        assert!(builder.otlp_endpoint.is_none());
        assert_eq!(builder.log_level, "info");
    }
}
