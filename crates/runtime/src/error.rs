use std::time::Duration;

use extkit_core::{ConfigError, Status};

/// Errors raised while registering scheduled tasks.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Task {0} has a zero interval")]
    ZeroInterval(String),

    #[error("Task {name} interval {interval:?} exceeds the maximum of {max:?}")]
    IntervalTooLong { name: String, interval: Duration, max: Duration },
}

/// Errors returned by an ingest transport.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ingest endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode ingest response: {0}")]
    Decode(String),

    #[error("Ingest transport unavailable: {0}")]
    Unavailable(String),
}

impl IngestError {
    /// Whether the same payload may succeed later. The endpoint being
    /// unreachable or failing with 5xx is transient; a 4xx response or an
    /// undecodable reply means resending the payload will not help.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Http(_) | IngestError::Unavailable(_) => true,
            IngestError::Status { status, .. } => *status >= 500,
            IngestError::Decode(_) => false,
        }
    }
}

/// Errors that stop the runtime from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("Fast check failed: {0}")]
    FastCheckFailed(Status),

    #[error("Initialization failed: {0}")]
    Initialization(String),
}
