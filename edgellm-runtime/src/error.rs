//! Error types for the EdgeLLM runtime.

use edgellm_core::{BackendError, JobStoreError, QueueError};

/// Runtime startup and wiring errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Could not open the database
    #[error("Failed to open database: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration or recovery failed
    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),

    /// Could not build the Ollama client
    #[error("Ollama client error: {0}")]
    Backend(#[from] BackendError),

    /// Queue rejected a request made by the runtime itself
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Map a transport failure onto the backend error taxonomy
pub(crate) fn from_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if err.is_decode() {
        BackendError::invalid(err.to_string())
    } else if err.is_builder() {
        BackendError::invalid_request(err.to_string())
    } else {
        BackendError::connection(err.to_string())
    }
}
