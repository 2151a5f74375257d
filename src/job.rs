//! Batch job model and state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::TransitionError;

/// Batch render job snapshot.
///
/// Counters only grow, and `completed + failed <= total` holds at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub status: JobStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: Vec<RecordFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Size in bytes of the stored archive, once one exists.
    pub archive_size: Option<usize>,
}

/// One failed record, or a job-level failure when `record_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only: pending → processing → {completed | failed}, plus
    /// pending → failed for precondition errors.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl BatchJob {
    pub fn new(total: usize) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            archive_size: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Fixes the record count once the source has been resolved.
    pub fn set_total(&mut self, total: usize) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.total = total;
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)
    }

    /// Counts one rendered record. Ignored once every record is accounted for.
    pub fn record_success(&mut self) -> bool {
        if self.status != JobStatus::Processing || self.settled() >= self.total {
            return false;
        }
        self.completed += 1;
        true
    }

    /// Counts one failed record and keeps its error.
    pub fn record_failure(&mut self, record_id: impl Into<String>, message: impl Into<String>) -> bool {
        if self.status != JobStatus::Processing || self.settled() >= self.total {
            return false;
        }
        self.failed += 1;
        self.errors.push(RecordFailure {
            record_id: Some(record_id.into()),
            message: message.into(),
        });
        true
    }

    /// Terminal status once every record task has settled: `failed` only if
    /// no record succeeded.
    pub fn finish(&mut self, archive_size: Option<usize>) -> Result<(), TransitionError> {
        let next = if self.failed == self.total {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.transition(next)?;
        self.archive_size = archive_size;
        Ok(())
    }

    /// Fails the whole job with a single job-level error entry.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.errors.push(RecordFailure {
            record_id: None,
            message: message.into(),
        });
        Ok(())
    }

    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    /// Fraction of records settled, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        self.settled() as f64 / self.total as f64
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds())
    }
}
