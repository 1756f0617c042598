// EdgeLLM Core Library
//
// Admission queue, job persistence, stream fan-out and resilience primitives
// for an appliance that shares one local LLM runtime between many clients.

pub mod backend;
pub mod broker;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod resilience;

pub use backend::{BackendChunk, ChunkStream, InferenceBackend, JobRequest, ModelResolver};
pub use broker::{StreamBroker, StreamEvent, Subscription};
pub use error::{BackendError, CircuitOpenError, JobStoreError, QueueError};
pub use jobs::{Job, JobId, JobStatus, JobStore, JobStoreConfig};
pub use queue::{EnqueueOptions, EnqueueResult, QueueConfig, QueueEvent, QueueManager, QueueStatus};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, ResiliencePolicy, RetryConfig};
