//! Error types for media-relay.

use crate::jobs::JobId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job-related errors surfaced synchronously to the caller.
///
/// Everything that happens after admission is reported asynchronously as a
/// terminal progress event instead.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Too many concurrent downloads ({active}/{max})")]
    TooManyJobs { active: usize, max: usize },

    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("URL is required")]
    MissingUrl,
}

/// Errors seen by the reconnecting client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server has no live record for the job (evicted or never existed).
    #[error("Job {job_id} not found on server")]
    JobNotFound { job_id: JobId },

    #[error("Server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed event stream: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
