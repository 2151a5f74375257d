//! In-memory job registry with time-based expiry.
//!
//! The store is the single mutation path for job state: callers read cloned
//! snapshots and change a job through [`JobStore::update`]. Jobs and their
//! archives are dropped once their start time is older than the retention
//! window, whether or not anyone fetched the result.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::BatchJob;
use crate::lock::mutex_lock;

const SOURCE: &str = "store";

/// Default job retention (1 hour).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Default sweep interval (10 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct JobSlot {
    job: BatchJob,
    archive: Option<Arc<Vec<u8>>>,
}

pub struct JobStore {
    jobs: Mutex<HashMap<String, JobSlot>>,
    retention: Duration,
}

impl JobStore {
    /// Creates an empty store.
    ///
    /// # Arguments
    ///
    /// * `retention` - How long a job and its archive live after the job starts
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Registers a new pending job and returns its snapshot.
    pub fn create(&self, total: usize) -> BatchJob {
        let job = BatchJob::new(total);
        mutex_lock(&self.jobs, SOURCE, "create").insert(
            job.job_id.clone(),
            JobSlot {
                job: job.clone(),
                archive: None,
            },
        );
        debug!(job_id = %job.job_id, total, "Job created");
        job
    }

    /// Snapshot of the job, or `None` if it never existed or was swept.
    pub fn get(&self, job_id: &str) -> Option<BatchJob> {
        mutex_lock(&self.jobs, SOURCE, "get")
            .get(job_id)
            .map(|slot| slot.job.clone())
    }

    /// The job's archive once stored; `None` while running, when nothing
    /// succeeded, or after the job was swept.
    pub fn get_archive(&self, job_id: &str) -> Option<Arc<Vec<u8>>> {
        mutex_lock(&self.jobs, SOURCE, "get_archive")
            .get(job_id)
            .and_then(|slot| slot.archive.clone())
    }

    /// Applies `f` to the stored job. Returns `None` if the job is gone.
    pub fn update<R>(&self, job_id: &str, f: impl FnOnce(&mut BatchJob) -> R) -> Option<R> {
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "update");
        jobs.get_mut(job_id).map(|slot| f(&mut slot.job))
    }

    /// Stores the finished archive for `job_id`. Returns `false` if the job
    /// has already been swept.
    pub fn put_archive(&self, job_id: &str, archive: Vec<u8>) -> bool {
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "put_archive");
        match jobs.get_mut(job_id) {
            Some(slot) => {
                slot.archive = Some(Arc::new(archive));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.jobs, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Removes jobs started more than the retention window before `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "sweep");
        let before = jobs.len();
        jobs.retain(|_, slot| now.signed_duration_since(slot.job.started_at) <= retention);
        before - jobs.len()
    }

    pub fn sweep(&self) -> usize {
        let removed = self.sweep_at(Utc::now());
        if removed > 0 {
            info!(removed, remaining = self.len(), "Expired jobs swept");
        }
        removed
    }

    /// Runs [`JobStore::sweep`] every `interval` until `shutdown` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `interval` - Sweep period; zero falls back to [`DEFAULT_SWEEP_INTERVAL`]
    /// * `shutdown` - Stops the task when cancelled
    ///
    /// # Returns
    ///
    /// The sweeper task handle, which completes after `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            warn!(
                default = ?DEFAULT_SWEEP_INTERVAL,
                "Zero sweep interval, using default"
            );
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Job sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.sweep();
                    }
                }
            }
        })
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
