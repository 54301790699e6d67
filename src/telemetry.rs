//! OpenTelemetry bootstrap and the gateway's metric instruments.
//!
//! Traces and metrics are exported over OTLP HTTP/protobuf to the collector
//! named by `OTEL_EXPORTER_OTLP_ENDPOINT`, which must be set for `serve`.
//! Instruments are created from the global meter, so they are no-ops until
//! [`init_telemetry`] installs a real provider.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};

use crate::error::GatewayError;

/// Environment variable naming the OTLP collector endpoint.
pub const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";
const DEFAULT_SERVICE_NAME: &str = "hostgate";
const INSTRUMENTATION_SCOPE: &str = "hostgate";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub service_name: String,
}

impl TelemetryConfig {
    /// Read the collector endpoint and service name from the environment.
    ///
    /// A missing or empty endpoint is an error.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`TelemetryConfig::from_env`] against an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup(ENDPOINT_ENV)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Telemetry(format!("{ENDPOINT_ENV} must be set to the collector endpoint"))
            })?;
        let service_name =
            lookup(SERVICE_NAME_ENV).unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        Ok(Self {
            endpoint,
            service_name,
        })
    }
}

/// Holds the installed providers for the lifetime of the process.
///
/// Call [`TelemetryGuard::shutdown`] on exit to flush pending spans and metrics.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    /// Tracer to hand to the `tracing` bridge layer.
    pub fn tracer(&self) -> SdkTracer {
        self.tracer_provider.tracer(INSTRUMENTATION_SCOPE)
    }

    pub fn shutdown(&self) -> crate::Result<()> {
        let traces = self
            .tracer_provider
            .shutdown()
            .map_err(|e| GatewayError::Telemetry(format!("tracer shutdown failed: {e}")));
        let metrics = self
            .meter_provider
            .shutdown()
            .map_err(|e| GatewayError::Telemetry(format!("meter shutdown failed: {e}")));
        traces.and(metrics)
    }
}

/// Build OTLP span and metric exporters and install them as the global providers.
///
/// The exporters read the endpoint from the standard OTLP environment variables;
/// `config.endpoint` has already been checked to be present.
pub fn init_telemetry(config: &TelemetryConfig) -> crate::Result<TelemetryGuard> {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .build()
        .map_err(|e| GatewayError::Telemetry(format!("failed to build span exporter: {e}")))?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter)
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .build()
        .map_err(|e| GatewayError::Telemetry(format!("failed to build metric exporter: {e}")))?;
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    tracing::info!(endpoint = %config.endpoint, service = %config.service_name, "telemetry export enabled");

    Ok(TelemetryGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Counters and histograms recorded by the gateway.
#[derive(Clone)]
pub struct GatewayMetrics {
    requests: Counter<u64>,
    request_failures: Counter<u64>,
    auth_failures: Counter<u64>,
    restarts: Counter<u64>,
    call_duration: Histogram<f64>,
    streams_opened: Counter<u64>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let meter = global::meter(INSTRUMENTATION_SCOPE);
        Self {
            requests: meter
                .u64_counter("hostgate.requests")
                .with_description("Protocol messages dispatched to managed servers")
                .build(),
            request_failures: meter
                .u64_counter("hostgate.request.failures")
                .with_description("Requests that ended in a gateway error")
                .build(),
            auth_failures: meter
                .u64_counter("hostgate.auth.failures")
                .with_description("Requests rejected by the allowlist or bearer check")
                .build(),
            restarts: meter
                .u64_counter("hostgate.server.restarts")
                .with_description("Automatic restarts of managed servers")
                .build(),
            call_duration: meter
                .f64_histogram("hostgate.call.duration")
                .with_unit("s")
                .with_description("Write plus reply time of bridged calls")
                .build(),
            streams_opened: meter
                .u64_counter("hostgate.streams.opened")
                .with_description("Event streams opened on the direct route")
                .build(),
        }
    }

    pub fn record_request(&self, server_id: &str, kind: &'static str) {
        self.requests.add(
            1,
            &[
                KeyValue::new("server_id", server_id.to_string()),
                KeyValue::new("kind", kind),
            ],
        );
    }

    pub fn record_request_failure(&self, error: &GatewayError) {
        self.request_failures
            .add(1, &[KeyValue::new("error_code", error.code().as_str())]);
    }

    pub fn record_auth_failure(&self, reason: &'static str) {
        self.auth_failures.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_restart(&self, server_id: &str) {
        self.restarts
            .add(1, &[KeyValue::new("server_id", server_id.to_string())]);
    }

    pub fn record_call_duration(&self, server_id: &str, seconds: f64) {
        self.call_duration
            .record(seconds, &[KeyValue::new("server_id", server_id.to_string())]);
    }

    pub fn record_stream_opened(&self, server_id: &str) {
        self.streams_opened
            .add(1, &[KeyValue::new("server_id", server_id.to_string())]);
    }
}
