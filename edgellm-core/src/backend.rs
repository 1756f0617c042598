//! Seams to the inference runtime.
//!
//! The queue manager only talks to the LLM runtime through these traits;
//! `edgellm-runtime` implements them for Ollama and tests use in-memory
//! fakes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::jobs::JobId;

/// Everything a backend needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub conversation_id: i64,
    pub job_type: String,
    pub model: String,
    /// Caller-supplied request body, opaque to the queue
    pub payload: serde_json::Value,
}

/// One unit of backend output
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChunk {
    /// Generated text and/or reasoning
    Token { content: String, thinking: Option<String> },
    /// Phase change worth surfacing to listeners
    Status { phase: String, message: Option<String> },
    /// Retrieved documents, replacing any earlier set
    Sources(serde_json::Value),
    /// Knowledge spaces that matched the query
    MatchedSpaces(serde_json::Value),
}

impl BackendChunk {
    pub fn token(content: impl Into<String>) -> Self {
        BackendChunk::Token { content: content.into(), thinking: None }
    }
}

/// Stream of backend output; ends when generation is finished
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<BackendChunk, BackendError>> + Send>>;

/// Streams generations from the LLM runtime
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start generating for `request`.
    ///
    /// Dropping the returned stream aborts the underlying call.
    async fn stream(&self, request: &JobRequest) -> Result<ChunkStream, BackendError>;
}

/// Knows which model is resident and how to change it
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Model a job should run against: the requested one if valid, the
    /// default otherwise
    async fn resolve_model(&self, requested: Option<&str>) -> Result<String, BackendError>;

    /// Model currently loaded in accelerator memory, if any
    async fn loaded_model(&self) -> Result<Option<String>, BackendError>;

    /// Unload whatever is resident and load `model`
    async fn switch_model(&self, model: &str) -> Result<(), BackendError>;
}
