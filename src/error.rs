//! Error types shared by the pool, cache, orchestrator and their collaborators.

use thiserror::Error;

/// Failure of a single render operation or of the backend behind it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The backend instance could not be started.
    #[error("failed to launch render backend: {0}")]
    Launch(String),

    /// The backend instance reported itself disconnected.
    #[error("render backend disconnected")]
    Disconnected,

    /// A new render context could not be created on the live instance.
    #[error("failed to create render context: {0}")]
    ContextCreation(String),

    /// The render call did not finish within the configured timeout.
    #[error("render timed out after {0} ms")]
    Timeout(u64),

    /// The backend rejected the document or failed while rendering it.
    #[error("render failed: {0}")]
    Backend(String),

    /// The pool has been shut down and hands out no more contexts.
    #[error("render pool is shut down")]
    ShutDown,
}

impl RenderError {
    /// Whether the context that produced this error must not be reused.
    pub fn poisons_context(&self) -> bool {
        matches!(
            self,
            RenderError::Disconnected | RenderError::Timeout(_) | RenderError::Launch(_)
        )
    }
}

/// Failure reported by a record source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("record source unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("malformed record data: {0}")]
    Malformed(String),
}

/// Failure while mapping a record or substituting a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("field `{field}` is not a scalar value")]
    NotScalar { field: String },

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("template is empty")]
    Empty,
}

/// Failure while packaging outputs into the batch archive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("duplicate archive entry `{0}`")]
    Duplicate(String),

    #[error("archive already finished")]
    Finished,

    #[error("archive write failed: {0}")]
    Write(String),
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        ArchiveError::Write(err.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Write(err.to_string())
    }
}

/// Recoverable failure of one record inside a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("mapping failed: {0}")]
    Mapping(TemplateError),

    #[error("document template failed: {0}")]
    Template(TemplateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("record task aborted: {0}")]
    Aborted(String),
}

/// Failure that aborts a whole batch before any record is dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("cannot resolve records: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("record selection matched no records")]
    NoRecords,

    #[error("cannot resolve document template: {0}")]
    TemplateUnavailable(TemplateError),

    #[error("cannot build archive: {0}")]
    Archive(ArchiveError),
}

/// Rejected job status change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: crate::job::JobStatus,
    pub to: crate::job::JobStatus,
}
