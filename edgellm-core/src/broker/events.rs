//! Events delivered to per-job subscribers.

use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobId, JobStatus};

/// One event on a job's stream, serialized with a `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The job left the queue and the backend call is starting
    JobStarted { job_id: JobId, model: String },

    /// Incremental output
    Response {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },

    /// Phase change such as a model switch or a retrieval step
    Status {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Retrieved documents backing the answer
    Sources { sources: serde_json::Value },

    /// Knowledge spaces that matched the query
    MatchedSpaces { spaces: serde_json::Value },

    Error { message: String },

    /// Final event of every job
    Done {
        status: JobStatus,
        content: String,
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    /// Snapshot of persisted state sent to a subscriber that attached late
    Reconnect {
        status: JobStatus,
        content: String,
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_position: Option<usize>,
    },
}

impl StreamEvent {
    pub fn response(token: impl Into<String>, thinking: Option<String>) -> Self {
        StreamEvent::Response { token: token.into(), thinking }
    }

    pub fn status(phase: impl Into<String>, message: Option<String>) -> Self {
        StreamEvent::Status { phase: phase.into(), message }
    }

    pub fn done(job: &Job) -> Self {
        StreamEvent::Done {
            status: job.status,
            content: job.content.clone(),
            thinking: job.thinking.clone(),
            sources: job.sources.clone(),
            error_message: job.error_message.clone(),
        }
    }

    pub fn reconnect(job: &Job) -> Self {
        StreamEvent::Reconnect {
            status: job.status,
            content: job.content.clone(),
            thinking: job.thinking.clone(),
            sources: job.sources.clone(),
            queue_position: job.queue_position,
        }
    }

    /// Events closing a finished job: `error` then `done` for failed jobs,
    /// `done` alone otherwise
    pub fn terminal(job: &Job) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(2);
        if job.status == JobStatus::Error {
            events.push(StreamEvent::Error {
                message: job.error_message.clone().unwrap_or_else(|| "Job failed".to_string()),
            });
        }
        events.push(StreamEvent::done(job));
        events
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    /// Tag used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::JobStarted { .. } => "job_started",
            StreamEvent::Response { .. } => "response",
            StreamEvent::Status { .. } => "status",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::MatchedSpaces { .. } => "matched_spaces",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Reconnect { .. } => "reconnect",
        }
    }
}
