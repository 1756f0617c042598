//! Admission queue for the single local inference backend.
//!
//! Only one model fits in accelerator memory, so jobs run strictly one at a
//! time. Everything else waits in priority order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  enqueue(conversation, …)                │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ create job + message (one transaction)
//!                    ┌────────▼────────┐
//!                    │  Pending list   │ ← priority desc, then FIFO
//!                    │  prioritize /   │
//!                    │  cancel         │
//!                    └────────┬────────┘
//!                             │ process_next (slot claimed under lock)
//!                    ┌────────▼────────┐
//!                    │  Active slot    │ ← at most one job
//!                    │  model switch?  │
//!                    └────────┬────────┘
//!                             │ chunk: persist, then notify
//!              ┌──────────────┴──────────────┐
//!     ┌────────▼────────┐           ┌────────▼────────┐
//!     │    JobStore     │           │  StreamBroker   │ ← per-job listeners
//!     └─────────────────┘           └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single-flight**: the execution slot is claimed before any await point
//! - **Priority**: `prioritize_job` moves a waiting job to the front
//! - **Cancellation**: waiting jobs are dropped, running ones aborted
//!   through a `CancellationToken` and the slot freed at once
//! - **Model hot-swap**: a job for a different model triggers unload/load
//! - **Timeouts**: a job exceeding `job_timeout` is failed
//! - **Events**: queue-wide notifications on a broadcast channel

mod config;
mod events;
mod manager;
mod metrics;
mod state;

pub use config::QueueConfig;
pub use events::{ProcessingJob, QueueEvent, QueueStatus, WaitingJob};
pub use manager::{EnqueueOptions, EnqueueResult, QueueManager};
pub use metrics::{MetricsSnapshot, QueueMetrics};
