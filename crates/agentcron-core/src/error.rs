use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentcronError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentcronError {
    /// Short error code string for operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            AgentcronError::Config(_) => "CONFIG_ERROR",
            AgentcronError::JobNotFound { .. } => "JOB_NOT_FOUND",
            AgentcronError::RunNotFound { .. } => "RUN_NOT_FOUND",
            AgentcronError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            AgentcronError::Database(_) => "DATABASE_ERROR",
            AgentcronError::Serialization(_) => "SERIALIZATION_ERROR",
            AgentcronError::Io(_) => "IO_ERROR",
            AgentcronError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentcronError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            AgentcronError::JobNotFound { id: "x".into() }.code(),
            "JOB_NOT_FOUND"
        );
        assert_eq!(AgentcronError::RunNotFound { id: "r".into() }.code(), "RUN_NOT_FOUND");
        let io = AgentcronError::from(std::io::Error::other("disk"));
        assert_eq!(io.code(), "IO_ERROR");
    }
}
