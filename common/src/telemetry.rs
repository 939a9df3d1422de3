// Structured logging, tracing export, and engine metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "jobs-engine";

/// Install the JSON log subscriber, plus an OTLP span exporter when `tracing_endpoint` is set
///
/// `RUST_LOG` takes precedence over `log_level`. Fails when a global
/// subscriber is already installed.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    match tracing_endpoint {
        Some(endpoint) => {
            let tracer = init_tracer(endpoint)?;
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
        }
        None => registry.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );
    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter on `0.0.0.0:{metrics_port}` and describe engine metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("jobs_pushed_total", "Jobs accepted by the broker");
    describe_counter!("jobs_done_total", "Jobs that finished successfully");
    describe_counter!(
        "jobs_errored_total",
        "Jobs that ended in a terminal error, by error kind"
    );
    describe_counter!("jobs_retried_total", "Failed attempts scheduled for retry");
    describe_histogram!("job_duration_seconds", "Duration of single job attempts");
    describe_gauge!("job_queue_size", "Jobs waiting per worker type");
    describe_gauge!("triggers_active", "Triggers currently scheduled");

    tracing::info!(metrics_port = metrics_port, "Prometheus metrics exporter initialized");
    Ok(())
}

#[inline]
pub fn record_job_pushed(worker_type: &str) {
    counter!("jobs_pushed_total", "worker" => worker_type.to_string()).increment(1);
}

#[inline]
pub fn record_job_done(worker_type: &str) {
    counter!("jobs_done_total", "worker" => worker_type.to_string()).increment(1);
}

#[inline]
pub fn record_job_errored(worker_type: &str, kind: &str) {
    counter!(
        "jobs_errored_total",
        "worker" => worker_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_retried(worker_type: &str) {
    counter!("jobs_retried_total", "worker" => worker_type.to_string()).increment(1);
}

#[inline]
pub fn record_job_duration(worker_type: &str, duration: Duration) {
    histogram!("job_duration_seconds", "worker" => worker_type.to_string())
        .record(duration.as_secs_f64());
}

#[inline]
pub fn update_queue_size(worker_type: &str, size: usize) {
    gauge!("job_queue_size", "worker" => worker_type.to_string()).set(size as f64);
}

#[inline]
pub fn update_active_triggers(count: usize) {
    gauge!("triggers_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_job_pushed("log");
        record_job_done("log");
        record_job_errored("log", "execution_timeout");
        record_job_retried("log");
        record_job_duration("log", Duration::from_millis(1500));
        update_queue_size("log", 3);
        update_active_triggers(2);
    }
}
