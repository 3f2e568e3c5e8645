use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Parameters or results that could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The submission is missing a mandatory field.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Every execution slot of the tenant is taken.
    #[error("Worker pool saturated for tenant {tenant}")]
    PoolSaturated { tenant: String },

    /// The worker pool no longer accepts jobs.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// A stored row could not be mapped back to a [`JobRecord`](crate::types::JobRecord).
    #[error("Corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

impl SchedulerError {
    /// Short, stable error code for CLI output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::PoolSaturated { .. } => "POOL_SATURATED",
            SchedulerError::ShuttingDown => "SHUTTING_DOWN",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Outcome of a work implementation other than success.
///
/// `Cancelled` ends the job as ABORTED; every other variant ends it as FAILED.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The work observed a stop request and gave up.
    #[error("job cancelled")]
    Cancelled,

    #[error("missing parameter: {name}")]
    MissingParameter { name: String },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A context call (progress, heartbeat) failed against the store.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkError::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        WorkError::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub fn error_detail(err: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        detail.push_str("\ncaused by: ");
        detail.push_str(&e.to_string());
        cause = e.source();
    }
    detail
}
