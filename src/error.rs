//! Error types for EcoCompute.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Shared blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job and microtask errors raised by requester operations.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Microtask {task_id} not found in job {job_id}")]
    MicrotaskNotFound { job_id: String, task_id: String },

    #[error("Invalid job input: {reason}")]
    InvalidInput { reason: String },
}

/// Execution sandbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Execution unit {slot} is not accepting tasks")]
    UnitUnavailable { slot: usize },

    #[error("Execution unit {slot} inbox is full")]
    UnitBusy { slot: usize },

    #[error("Execution unit {slot} does not exist (pool size {size})")]
    NoSuchUnit { slot: usize, size: usize },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
