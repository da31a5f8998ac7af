use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Initialize tracing for a controller process.
///
/// - `service_name`: reported as `service.name` on exported spans
/// - `otlp_endpoint`: if `Some`, spans are exported via OTLP/HTTP to this base URL
/// - `otlp_token`: optional bearer token for the collector
/// - `log_format`: `"json"` for one JSON object per line, anything else for text
///
/// Returns the tracer provider when OTLP export is active; the caller keeps it
/// alive and calls `shutdown()` before exit.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    otlp_token: Option<&str>,
    log_format: &str,
) -> Option<TracerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(fmt_layer(log_format))
            .with(env_filter)
            .init();
        return None;
    };

    let mut headers = std::collections::HashMap::new();
    if let Some(token) = otlp_token.filter(|t| !t.is_empty()) {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build()
    {
        Ok(e) => e,
        Err(err) => {
            eprintln!("failed to create OTLP exporter: {err}, logging to stdout only");
            tracing_subscriber::registry()
                .with(fmt_layer(log_format))
                .with(env_filter)
                .init();
            return None;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));

    tracing_subscriber::registry()
        .with(fmt_layer(log_format))
        .with(env_filter)
        .with(otel_layer)
        .init();

    tracing::info!(endpoint, service_name, "OTLP tracing enabled");
    Some(provider)
}

fn fmt_layer(log_format: &str) -> Box<dyn Layer<Registry> + Send + Sync> {
    match log_format {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    }
}
