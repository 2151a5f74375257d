//! Telemetry and structured logging for the render worker.

use crate::cache::CacheStats;
use crate::job::{BatchJob, JobStatus};
use crate::pool::PoolStats;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRACER_NAME: &str = "render-worker";

/// Batches slower than this log a warning.
const SLOW_JOB_THRESHOLD_MS: i64 = 60_000;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` selects the filter (default `info`); `LOG_FORMAT=json` switches
/// the fmt layer to JSON lines.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

/// Records telemetry for a batch job that reached a terminal status.
///
/// Emits one span carrying the job counters and a structured log line.
/// Job-level failures are reported with their error message.
///
/// # Arguments
///
/// * `job` - The completed or failed job
pub fn record_job_telemetry(job: &BatchJob) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("batch_render_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("total", job.total as i64));
    span.set_attribute(KeyValue::new("completed", job.completed as i64));
    span.set_attribute(KeyValue::new("failed", job.failed as i64));
    if let Some(size) = job.archive_size {
        span.set_attribute(KeyValue::new("archive_bytes", size as i64));
    }

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            duration_ms = duration_ms,
            status = %job.status,
            completed = job.completed,
            failed = job.failed,
            "Batch job telemetry"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Batch job exceeded performance threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if job.status == JobStatus::Failed {
        let job_level = job.errors.iter().find(|e| e.record_id.is_none());
        if let Some(error) = job_level {
            span.set_attribute(KeyValue::new("error", error.message.clone()));
            warn!(
                job_id = %job.job_id,
                error = %error.message,
                "Batch job failed"
            );
        }
    }

    span.end();
}

/// Records a pool and cache heartbeat.
///
/// # Arguments
///
/// * `pool` - Current pool counters
/// * `cache` - Current cache occupancy
pub fn record_pool_heartbeat(pool: PoolStats, cache: CacheStats) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("pool_heartbeat");

    span.set_attribute(KeyValue::new("pool_idle", pool.idle as i64));
    span.set_attribute(KeyValue::new("pool_leased", pool.leased as i64));
    span.set_attribute(KeyValue::new("pool_generation", pool.generation as i64));
    span.set_attribute(KeyValue::new("cache_size", cache.size as i64));
    span.set_attribute(KeyValue::new("cache_capacity", cache.capacity as i64));
    span.end();

    info!(
        idle = pool.idle,
        leased = pool.leased,
        created = pool.created,
        generation = pool.generation,
        cache_size = cache.size,
        "Pool heartbeat"
    );
}

/// Initializes OpenTelemetry with OTLP exporter.
///
/// This should be called once at worker startup. Reads configuration
/// from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: render-worker)
///
/// # Errors
///
/// Returns an error if the exporter pipeline cannot be installed.
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}
