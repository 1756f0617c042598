//! Process-wide queue notifications and status snapshots.

use serde::Serialize;

use crate::jobs::{JobId, JobStatus};

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Jobs waiting behind the running one
    pub queue_length: usize,
    pub processing_job: Option<ProcessingJob>,
    /// Waiting jobs in execution order
    pub waiting_jobs: Vec<WaitingJob>,
    pub current_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingJob {
    pub job_id: JobId,
    pub conversation_id: i64,
    pub job_type: String,
    pub model: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitingJob {
    pub job_id: JobId,
    pub conversation_id: i64,
    pub job_type: String,
    pub model: String,
    pub priority: i32,
    /// 1 for the job that runs next
    pub position: usize,
}

/// Broadcast to every `QueueManager::events` receiver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Queue contents changed
    QueueUpdated { status: QueueStatus },
    /// A job needs a different model than the resident one
    ModelSwitching { job_id: JobId, from: Option<String>, to: String },
    /// The requested model is loaded
    ModelSwitched { job_id: JobId, model: String },
    JobStarted { job_id: JobId, model: String },
    JobFinished { job_id: JobId, status: JobStatus },
}
