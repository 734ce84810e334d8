use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-boardwalk";
const OTEL_STDOUT_ENV: &str = "BOARDWALK_OTEL_STDOUT";

/// Process-wide logging, tracing and metrics setup. Dropping it flushes the
/// span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &tracer_provider {
            global::set_tracer_provider(provider.clone());
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV})");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    describe_counter!("boardwalk_connections_total", "Websocket connections accepted");
    describe_gauge!("boardwalk_connections_active", "Connections tracked by the heartbeat monitor");
    describe_gauge!("boardwalk_rooms_active", "Rooms with at least one local member");
    describe_counter!("boardwalk_subscriptions_total", "Room topics subscribed on the broker");
    describe_counter!("boardwalk_published_total", "Room events published to the broker");
    describe_counter!("boardwalk_publish_failures_total", "Room events the broker refused");
    describe_counter!("boardwalk_delivered_total", "Frames handed to local connections by fanout");
    describe_counter!("boardwalk_dropped_total", "Fanout frames dropped on full outbound buffers");
    describe_counter!(
        "boardwalk_malformed_deliveries_total",
        "Broker deliveries dropped before fanout"
    );
    describe_counter!("boardwalk_protocol_errors_total", "Client frames answered with an error");
    describe_counter!(
        "boardwalk_heartbeat_terminated_total",
        "Connections terminated for missing a liveness probe"
    );
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| is_truthy(&val))
}

fn is_truthy(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
