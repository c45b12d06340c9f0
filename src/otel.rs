//! OTLP export of the `function_execution` spans recorded by the executor.

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::logging::{env_filter, fmt_layer};

pub const DEFAULT_SERVICE_NAME: &str = "fn-meter";

/// Flushes pending spans and shuts the provider down when dropped.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("otel shutdown failed: {err}");
        }
    }
}

/// Same subscriber as [`crate::logging::init_logging`] plus an OTLP/HTTP span exporter.
/// `endpoint` falls back to the `OTEL_EXPORTER_OTLP_*` environment variables.
pub fn init_tracing(
    service_name: &str,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter.build()?)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    tracing::debug!(service_name, endpoint = ?endpoint, "otlp span export enabled");
    Ok(OtelGuard { provider })
}
