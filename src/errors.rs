use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TbError {
    #[error("No free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("Image build failed for '{image}': {reason}")]
    BuildFailure { image: String, reason: String },

    #[error("'{resource}' not ready after {waited:?}: {last_failure}")]
    ReadinessTimeout {
        resource: String,
        waited: Duration,
        last_failure: String,
    },

    #[error("Teardown incomplete: {}", .0.join("; "))]
    TeardownFailure(Vec<String>),

    #[error("Dependency '{0}' is not running")]
    DependencyNotRunning(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("Name '{0}' is already in use")]
    NameConflict(String),

    #[error("Invalid environment state: {0}")]
    InvalidState(String),

    #[error("Provisioning cancelled before '{0}' started")]
    Cancelled(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TbError {
    /// Absent resources count as already torn down
    pub fn is_not_found(&self) -> bool {
        matches!(self, TbError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TbError>;
