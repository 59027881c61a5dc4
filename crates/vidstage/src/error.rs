use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced to callers of the job lifecycle.
///
/// Per-segment hardware encode failures are recovered inside the transcoder
/// and never show up here.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} is already being processed")]
    AlreadyProcessing(String),
    #[error("job {0} is still processing; cancel it before cleanup")]
    StillProcessing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid job key: {0}")]
    InvalidKey(String),
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("segment {segment} failed with both hardware and software encoders: {reason}")]
    EncodeFailed { segment: usize, reason: String },
    #[error("stream-copy concatenation failed: {0}")]
    ConcatFailed(String),
    #[error("job was cancelled")]
    Cancelled,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::AlreadyProcessing(_) | JobError::StillProcessing(_)
        )
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
