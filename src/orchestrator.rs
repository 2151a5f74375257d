//! Batch job orchestration.
//!
//! A batch resolves all of its records up front, then dispatches one task per
//! record straight away. Tasks pass through a semaphore of fixed width before
//! rendering, which is the only back-pressure. Record failures are counted
//! and kept on the job without touching sibling tasks; successful outputs go
//! into one ZIP archive stored with the job.
//!
//! Status ends as `failed` only when every record failed or a job-level
//! precondition (record source, document template) could not be met.

use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveBuilder;
use crate::error::{JobError, RecordError, SourceError};
use crate::job::BatchJob;
use crate::lock::mutex_lock;
use crate::options::{RenderOptions, RenderRequest};
use crate::render::RenderService;
use crate::source::{RecordQuery, RecordSource, SourceRecord};
use crate::store::JobStore;
use crate::telemetry;
use crate::template::{sanitize_filename, DocumentData, FieldMapper, PlaceholderTemplate, TemplateRenderer};

const SOURCE: &str = "orchestrator";

/// Default fan-out width.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Which records a batch renders.
#[derive(Debug, Clone)]
pub enum RecordSelection {
    Query(RecordQuery),
    Ids(Vec<String>),
}

/// Everything needed to render one batch.
pub struct BatchRequest {
    pub source: Arc<dyn RecordSource>,
    pub selection: RecordSelection,
    pub mapper: Arc<dyn FieldMapper>,
    pub document_template: String,
    /// Rendered against the mapped data; falls back to the record id.
    pub filename_template: Option<String>,
    pub options: RenderOptions,
}

/// A record that could not be fetched by id.
struct Unresolved {
    record_id: String,
    error: SourceError,
}

struct BatchContext {
    job_id: String,
    store: Arc<JobStore>,
    renderer: Arc<RenderService>,
    templates: Arc<dyn TemplateRenderer>,
    mapper: Arc<dyn FieldMapper>,
    document_template: String,
    filename_template: Option<String>,
    options: RenderOptions,
    archive: Mutex<ArchiveBuilder>,
}

pub struct BatchOrchestrator {
    renderer: Arc<RenderService>,
    store: Arc<JobStore>,
    templates: Arc<dyn TemplateRenderer>,
    concurrency: usize,
}

impl BatchOrchestrator {
    /// Creates an orchestrator using [`PlaceholderTemplate`] for document and
    /// filename templates.
    ///
    /// # Arguments
    ///
    /// * `renderer` - Cache-backed render path shared by every batch
    /// * `store` - Registry holding job state and archives
    /// * `concurrency` - Renders in flight per batch; zero is treated as one
    pub fn new(renderer: Arc<RenderService>, store: Arc<JobStore>, concurrency: usize) -> Self {
        Self {
            renderer,
            store,
            templates: Arc::new(PlaceholderTemplate::new()),
            concurrency: concurrency.max(1),
        }
    }

    /// Replaces the template renderer.
    pub fn with_templates(mut self, templates: Arc<dyn TemplateRenderer>) -> Self {
        self.templates = templates;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Creates a pending job and drives it on a detached task.
    ///
    /// The returned snapshot can be polled through [`Self::status`]; the job
    /// always reaches a terminal status, even when nothing can be rendered.
    pub fn submit(self: &Arc<Self>, batch: BatchRequest) -> BatchJob {
        let job = self.store.create(0);
        let this = Arc::clone(self);
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            this.drive(&job_id, batch).await;
        });
        job
    }

    /// Creates a job and drives it to completion.
    ///
    /// # Returns
    ///
    /// The terminal job snapshot. Precondition failures (unusable source,
    /// invalid document template, empty selection) come back as a `failed`
    /// job rather than an error.
    pub async fn run(&self, batch: BatchRequest) -> BatchJob {
        let job = self.store.create(0);
        match self.drive(&job.job_id, batch).await {
            Some(done) => done,
            None => job,
        }
    }

    /// Current snapshot of a job; `None` once it has been swept.
    pub fn status(&self, job_id: &str) -> Option<BatchJob> {
        self.store.get(job_id)
    }

    /// ZIP archive of a finished job.
    ///
    /// # Returns
    ///
    /// `None` while the job runs, when no record succeeded, or after the job
    /// has been swept.
    pub fn result(&self, job_id: &str) -> Option<Arc<Vec<u8>>> {
        self.store.get_archive(job_id)
    }

    async fn drive(&self, job_id: &str, batch: BatchRequest) -> Option<BatchJob> {
        let resolved = match self.resolve(&batch).await {
            Ok(resolved) => resolved,
            Err(e) => return self.fail_job(job_id, &e),
        };
        let (records, unresolved) = resolved;
        let total = records.len() + unresolved.len();

        if total == 0 {
            return self.fail_job(job_id, &JobError::NoRecords);
        }

        let started = self.store.update(job_id, |job| {
            job.set_total(total)
                .and_then(|_| job.start_processing())
        });
        if let Some(Err(e)) = started {
            error!(job_id, error = %e, "Cannot start batch job");
            return self.store.get(job_id);
        }

        info!(
            job_id,
            total,
            concurrency = self.concurrency,
            "Batch job processing"
        );

        for missing in unresolved {
            warn!(job_id, record_id = %missing.record_id, error = %missing.error, "Record not resolved");
            self.store.update(job_id, |job| {
                job.record_failure(missing.record_id, missing.error.to_string())
            });
        }

        let ctx = Arc::new(BatchContext {
            job_id: job_id.to_string(),
            store: Arc::clone(&self.store),
            renderer: Arc::clone(&self.renderer),
            templates: Arc::clone(&self.templates),
            mapper: batch.mapper,
            document_template: batch.document_template,
            filename_template: batch.filename_template,
            options: batch.options,
            archive: Mutex::new(ArchiveBuilder::stored()),
        });

        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let record_id = record.id.clone();
            let ctx = Arc::clone(&ctx);
            let gate = Arc::clone(&gate);

            let handle = tokio::spawn(async move {
                let outcome = match gate.acquire_owned().await {
                    Ok(_permit) => process_record(&ctx, &record).await,
                    Err(e) => Err(RecordError::Aborted(e.to_string())),
                };
                settle(&ctx, &record.id, outcome);
            });
            handles.push((record_id, handle));
        }

        for (record_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(job_id, record_id = %record_id, error = %e, "Record task failed");
                settle(&ctx, &record_id, Err(RecordError::Aborted(e.to_string())));
            }
        }

        self.finalize(&ctx)
    }

    /// Resolves the record set. `Err` is job-level; ids that cannot be
    /// fetched individually are returned as unresolved records instead.
    async fn resolve(
        &self,
        batch: &BatchRequest,
    ) -> Result<(Vec<SourceRecord>, Vec<Unresolved>), JobError> {
        self.templates
            .validate(&batch.document_template)
            .map_err(JobError::TemplateUnavailable)?;

        match &batch.selection {
            RecordSelection::Query(query) => {
                let records = batch.source.fetch_records(query).await?;
                Ok((records, Vec::new()))
            }
            RecordSelection::Ids(ids) => {
                let fetched = batch.source.fetch_records_by_id(ids).await?;
                let mut records = Vec::with_capacity(ids.len());
                let mut unresolved = Vec::new();
                for (id, result) in ids.iter().zip(fetched) {
                    match result {
                        Ok(record) => records.push(record),
                        Err(error) => unresolved.push(Unresolved {
                            record_id: id.clone(),
                            error,
                        }),
                    }
                }
                Ok((records, unresolved))
            }
        }
    }

    fn fail_job(&self, job_id: &str, e: &JobError) -> Option<BatchJob> {
        error!(job_id, error = %e, "Batch job failed before dispatch");
        let job = self.store.update(job_id, |job| {
            if let Err(t) = job.fail(e.to_string()) {
                warn!(job_id = %job.job_id, error = %t, "Ignoring failure on settled job");
            }
            job.clone()
        })?;
        telemetry::record_job_telemetry(&job);
        Some(job)
    }

    fn finalize(&self, ctx: &BatchContext) -> Option<BatchJob> {
        let job_id = ctx.job_id.as_str();
        let completed = self.store.get(job_id).map_or(0, |j| j.completed);

        let archive = if completed > 0 {
            match mutex_lock(&ctx.archive, SOURCE, "finish").finish() {
                Ok(bytes) => Some(bytes),
                Err(e) => return self.fail_job(job_id, &JobError::Archive(e)),
            }
        } else {
            None
        };

        let archive_size = archive.as_ref().map(Vec::len);
        if let Some(bytes) = archive {
            self.store.put_archive(job_id, bytes);
        }

        let job = self.store.update(job_id, |job| {
            if let Err(e) = job.finish(archive_size) {
                warn!(job_id = %job.job_id, error = %e, "Cannot finish batch job");
            }
            job.clone()
        });

        match &job {
            Some(job) => {
                info!(
                    job_id,
                    status = %job.status,
                    completed = job.completed,
                    failed = job.failed,
                    archive_bytes = ?job.archive_size,
                    "Batch job finished"
                );
                telemetry::record_job_telemetry(job);
            }
            None => warn!(job_id, "Batch job expired before it finished"),
        }
        job
    }
}

async fn process_record(
    ctx: &Arc<BatchContext>,
    record: &SourceRecord,
) -> Result<String, RecordError> {
    let data = ctx.mapper.map(record).map_err(RecordError::Mapping)?;

    let document = ctx
        .templates
        .render(&ctx.document_template, &data)
        .map_err(RecordError::Template)?;

    let rendered = ctx
        .renderer
        .render(&RenderRequest::new(document.into_bytes(), ctx.options))
        .await?;

    let filename = derive_filename(ctx, &data, &record.id);
    let suffix = sanitize_filename(&record.id);
    let bytes = Arc::clone(&rendered.bytes);
    let archive_ctx = Arc::clone(ctx);
    // Archive writes copy whole outputs; keep them off the runtime workers.
    let stored = tokio::task::spawn_blocking(move || {
        mutex_lock(&archive_ctx.archive, SOURCE, "add").add_unique(&filename, &suffix, &bytes)
    })
    .await
    .map_err(|e| RecordError::Aborted(e.to_string()))??;

    debug!(
        job_id = %ctx.job_id,
        record_id = %record.id,
        filename = %stored,
        cache_hit = rendered.cache_hit,
        "Record rendered"
    );
    Ok(stored)
}

fn settle(ctx: &BatchContext, record_id: &str, outcome: Result<String, RecordError>) {
    let counted = match outcome {
        Ok(_) => ctx.store.update(&ctx.job_id, |job| job.record_success()),
        Err(e) => {
            warn!(job_id = %ctx.job_id, record_id, error = %e, "Record failed");
            ctx.store
                .update(&ctx.job_id, |job| job.record_failure(record_id, e.to_string()))
        }
    };
    if counted != Some(true) {
        debug!(job_id = %ctx.job_id, record_id, "Record outcome not counted");
    }
}

fn derive_filename(ctx: &BatchContext, data: &DocumentData, record_id: &str) -> String {
    let ext = ctx.options.output.extension();
    let fallback = || format!("{}.{}", sanitize_filename(record_id), ext);

    let Some(template) = ctx.filename_template.as_deref() else {
        return fallback();
    };

    match ctx.templates.render(template, data) {
        Ok(name) => {
            let name = sanitize_filename(&name);
            if name.is_empty() {
                fallback()
            } else if name.to_ascii_lowercase().ends_with(&format!(".{}", ext)) {
                name
            } else {
                format!("{}.{}", name, ext)
            }
        }
        Err(e) => {
            debug!(record_id, error = %e, "Filename template failed, using record id");
            fallback()
        }
    }
}
