//! Errors returned by supervisor operations.

/// Failed supervisor operation. None of these are fatal to the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("application {0} not found")]
    NotFound(String),

    #[error("application {0} is already running")]
    AlreadyRunning(String),

    #[error("application {0} is not running")]
    NotRunning(String),

    #[error("failed to start application {name}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
