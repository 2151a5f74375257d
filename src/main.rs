//! Batch Render Worker
//!
//! Renders one batch of records through the SVG backend and writes the
//! resulting ZIP archive.
//!
//! ## Pipeline
//!
//! - **Records**: JSON file (`RECORDS_PATH`)
//! - **Template**: SVG with `{{field}}` placeholders (`TEMPLATE_PATH`)
//! - **Backend**: pooled SVG contexts, PDF via svg2pdf or PNG via resvg
//! - **Output**: ZIP archive (`OUTPUT_PATH`)
//!
//! See [`worker_render::config`] for every setting. `RUST_LOG` selects the
//! log level (default: info), `LOG_FORMAT=json` switches to JSON logs.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use worker_render::cache::OutputCache;
use worker_render::config::WorkerConfig;
use worker_render::converter::SvgBackend;
use worker_render::orchestrator::{BatchOrchestrator, BatchRequest, RecordSelection};
use worker_render::options::RenderOptions;
use worker_render::pool::ResourcePool;
use worker_render::render::RenderService;
use worker_render::source::{JsonFileSource, RecordQuery};
use worker_render::store::JobStore;
use worker_render::template::FieldMapping;
use worker_render::{telemetry, BatchJob, JobStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging();

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting render worker");

    let config = WorkerConfig::from_env();
    info!(
        "Configuration: pool_size={}, cache_capacity={}, concurrency={}, format={}",
        config.pool_size, config.cache_capacity, config.batch_concurrency, config.output_format
    );

    let records_path = config
        .records_path
        .clone()
        .context("RECORDS_PATH must point to a JSON record file")?;
    let template_path = config
        .template_path
        .clone()
        .context("TEMPLATE_PATH must point to an SVG template")?;
    let document_template = tokio::fs::read_to_string(&template_path)
        .await
        .with_context(|| format!("Failed to read template {}", template_path.display()))?;

    let pool = Arc::new(ResourcePool::new(
        Arc::new(SvgBackend::new()),
        config.pool_size,
        config.render_timeout,
    ));
    let cache = Arc::new(OutputCache::new(config.cache_capacity, config.cache_ttl));
    let store = Arc::new(JobStore::new(config.job_retention));

    let shutdown = CancellationToken::new();
    let sweeper = store.spawn_sweeper(config.sweep_interval, shutdown.clone());

    let renderer = Arc::new(RenderService::new(Arc::clone(&pool), Arc::clone(&cache)));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        renderer,
        Arc::clone(&store),
        config.batch_concurrency,
    ));

    let job = orchestrator.submit(BatchRequest {
        source: Arc::new(JsonFileSource::new(records_path)),
        selection: RecordSelection::Query(RecordQuery::default()),
        mapper: Arc::new(FieldMapping::passthrough()),
        document_template,
        filename_template: config.filename_template.clone(),
        options: RenderOptions {
            output: config.output_format,
            ..Default::default()
        },
    });
    info!("Batch submitted: job_id={}", job.job_id);

    let outcome = tokio::select! {
        finished = wait_for_job(&orchestrator, &job.job_id) => Some(finished),
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping worker");
            None
        }
    };

    telemetry::record_pool_heartbeat(pool.stats(), cache.stats());

    let result = match outcome {
        Some(Some(finished)) => write_result(&orchestrator, &finished, &config.output_path),
        Some(None) => Err(anyhow::anyhow!("Job {} expired before finishing", job.job_id)),
        None => Ok(()),
    };

    pool.shutdown().await;
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Job sweeper task failed: {}", e);
    }

    info!("Render worker shutdown complete");
    result
}

/// Polls the job until it reaches a terminal status. `None` if it was swept.
async fn wait_for_job(orchestrator: &BatchOrchestrator, job_id: &str) -> Option<BatchJob> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let job = orchestrator.status(job_id)?;
        if job.status.is_terminal() {
            return Some(job);
        }
        info!(
            "Job progress: job_id={}, settled={}/{}",
            job.job_id,
            job.settled(),
            job.total
        );
    }
}

fn write_result(orchestrator: &BatchOrchestrator, job: &BatchJob, output: &Path) -> Result<()> {
    for failure in &job.errors {
        warn!(
            "Record failed: record_id={}, error={}",
            failure.record_id.as_deref().unwrap_or("-"),
            failure.message
        );
    }

    let summary = serde_json::to_string_pretty(job).context("Failed to serialize job status")?;
    println!("{}", summary);

    if job.status == JobStatus::Failed {
        bail!("Batch job {} failed", job.job_id);
    }

    let archive = orchestrator
        .result(&job.job_id)
        .context("Completed job has no archive")?;

    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut temp, &archive).context("Failed to write archive")?;
    temp.persist(output)
        .with_context(|| format!("Failed to persist archive to {}", output.display()))?;

    info!(
        "Archive written: path={}, bytes={}, completed={}, failed={}",
        output.display(),
        archive.len(),
        job.completed,
        job.failed
    );
    Ok(())
}
