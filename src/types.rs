//! Error types for neuron

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NeuronError>;

#[derive(Error, Debug)]
pub enum NeuronError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Relationship already terminated: {0}")]
    AlreadyTerminated(String),

    #[error("Provider mismatch: {0}")]
    ProviderMismatch(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
