//! Error types for the edgellm core library
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! QueueError (returned by the queue manager)
//! ├── JobStoreError     - Persistence of jobs and their messages
//! │   └── CircuitOpenError
//! ├── BackendError      - Inference backend and model resolver
//! │   └── CircuitOpenError
//! ├── Validation        - Rejected before anything is persisted
//! ├── QueueFull         - Admission limit reached
//! └── Shutdown          - Manager no longer admits jobs
//! ```
//!
//! Every infrastructure error implements [`Retryable`] so the resilience
//! layer can decide whether another attempt is worth it.

use std::io;

use thiserror::Error;

use crate::jobs::{JobId, JobStatus};
use crate::resilience::Retryable;

/// Returned by a circuit breaker that is failing fast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker for '{service}' is open")]
pub struct CircuitOpenError {
    pub service: String,
}

impl CircuitOpenError {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

/// Errors raised by the job store
#[derive(Error, Debug)]
pub enum JobStoreError {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Sources column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No row exists for the job
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// A write was attempted on a job that already reached a terminal state
    #[error("Job {job_id} is already {status} and accepts no further writes")]
    TerminalState { job_id: JobId, status: JobStatus },

    /// The requested status change is not part of the job state machine
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: JobId, from: JobStatus, to: JobStatus },

    /// A persisted row holds a value this version does not understand
    #[error("Corrupt job row: {0}")]
    Corrupt(String),

    /// The database circuit breaker is open
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl JobStoreError {
    /// Create a corrupt-row error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Whether the error came from the database rather than the job itself.
    ///
    /// Every `sqlx` failure counts, schema and constraint errors included.
    /// Domain outcomes (missing row, terminal job) never count against the
    /// database circuit breaker.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl Retryable for JobStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Io(io_err) => io_err.is_retryable(),
                sqlx::Error::Database(db_err) => {
                    // SQLITE_BUSY / SQLITE_LOCKED
                    matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Errors raised by the inference backend or the model resolver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Could not reach the backend at all
    #[error("Failed to connect to backend: {0}")]
    Connection(String),

    /// The backend did not answer in time
    #[error("Backend request timed out: {0}")]
    Timeout(String),

    /// The backend answered with a non-success HTTP status
    #[error("Backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The job payload cannot be turned into a backend request
    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),

    /// The backend answered but the payload was unusable
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// The job cannot run against the requested model
    #[error("Model error: {0}")]
    Model(String),

    /// The backend circuit breaker is open
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl BackendError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a status error
    pub fn status(status: u16, msg: impl Into<String>) -> Self {
        Self::Status { status, message: msg.into() }
    }

    /// Create an invalid-request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid-response error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::InvalidRequest(_)
            | Self::InvalidResponse(_)
            | Self::Model(_)
            | Self::CircuitOpen(_) => false,
        }
    }
}

/// Errors returned by the queue manager
#[derive(Error, Debug)]
pub enum QueueError {
    /// Request rejected before a job was created
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Admission limit reached
    #[error("Queue is full (max: {max})")]
    QueueFull { max: usize },

    /// The manager is shutting down and admits nothing
    #[error("Queue shutdown")]
    Shutdown,

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// Backend or model resolution failure
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl QueueError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// HTTP statuses worth another attempt: 429 and every 5xx.
///
/// Any other 4xx fails on the first attempt.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500..=599)
}

impl Retryable for io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::BrokenPipe
        )
    }
}
