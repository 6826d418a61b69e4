use crate::scope::ScopePathError;

/// Launch failures. Everything here is reported before a job id exists, so
/// none of these leave a registry entry or a staged file behind.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("stage secrets file: {0}")]
    Staging(#[source] std::io::Error),

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub fn invalid(message: impl Into<String>) -> Self {
        JobError::InvalidInput(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            JobError::InvalidInput(_) => "invalid_input",
            JobError::Staging(_) => "staging_failed",
            JobError::Spawn { .. } => "spawn_failed",
        }
    }
}

impl From<ScopePathError> for JobError {
    fn from(value: ScopePathError) -> Self {
        JobError::InvalidInput(value.to_string())
    }
}
