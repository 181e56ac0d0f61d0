use agentcron_core::AgentcronError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column or payload could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cron expression could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job names a timezone that is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A stored row holds a value the scheduler cannot interpret.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// An in-process store lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for AgentcronError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Database(e) => AgentcronError::Database(e.to_string()),
            SchedulerError::Serialization(e) => AgentcronError::Serialization(e),
            SchedulerError::InvalidSchedule(msg) => AgentcronError::InvalidSchedule(msg),
            SchedulerError::InvalidTimezone(tz) => {
                AgentcronError::InvalidSchedule(format!("unknown timezone {tz}"))
            }
            SchedulerError::JobNotFound { id } => AgentcronError::JobNotFound { id },
            other => AgentcronError::Internal(other.to_string()),
        }
    }
}
