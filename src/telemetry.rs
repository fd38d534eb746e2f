//! OpenTelemetry integration (C10 ambient stack): exports traces to an OTLP
//! collector when `telemetry.otlpEndpoint` is configured; a no-op otherwise.

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::Sampler, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{registry::LookupSpan, Layer};

use crate::config::TelemetryConfig;

/// Builds a tracing layer exporting to the configured OTLP endpoint, or
/// returns `None` when telemetry isn't configured or the exporter fails to
/// build (a broken collector shouldn't keep the server from starting).
pub fn init_telemetry<S>(config: &TelemetryConfig) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync,
{
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        tracing::debug!("telemetry.otlpEndpoint not set, OTLP export disabled");
        return None;
    };

    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint).build();

    let exporter = match exporter {
        Ok(exp) => exp,
        Err(e) => {
            tracing::warn!("failed to create OTLP exporter: {e}. telemetry disabled");
            return None;
        }
    };

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("tilemapd");
    opentelemetry::global::set_tracer_provider(provider);

    tracing::info!(endpoint, service_name = %config.service_name, "OpenTelemetry initialized");

    Some(Box::new(OpenTelemetryLayer::new(tracer)))
}

pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::debug!("OpenTelemetry shutdown complete");
}
