//! Error types for the dispatch pool.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Admission errors raised to the producer side of the intake queue.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Intake queue full, parcel {parcel_id} rejected")]
    Full { parcel_id: String },

    #[error("Intake queue closed, parcel {parcel_id} rejected")]
    Closed { parcel_id: String },
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {id} panicked outside task execution: {reason}")]
    Panicked { id: usize, reason: String },

    #[error("Worker {id} could not be joined: {reason}")]
    JoinFailed { id: usize, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
