//! Durable job records.
//!
//! A job row and its placeholder assistant message are created together;
//! output deltas are appended as they stream in and copied onto the message
//! when the job completes.

mod schema;
mod store;
mod types;

pub use store::{JobStore, JobStoreConfig, StoreResult};
pub use types::{ActiveStream, CreatedJob, Job, JobId, JobStatus, UnknownStatus};
