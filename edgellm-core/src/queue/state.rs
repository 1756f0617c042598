//! In-memory queue state guarded by the manager's mutex.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{ProcessingJob, QueueStatus, WaitingJob};
use crate::backend::JobRequest;
use crate::jobs::JobId;

/// A job waiting for the execution slot
#[derive(Debug, Clone)]
pub(crate) struct PendingJob {
    pub job_id: JobId,
    pub conversation_id: i64,
    pub job_type: String,
    pub model: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Admission order, breaks priority ties
    pub seq: u64,
    pub enqueued_at: Instant,
}

impl PendingJob {
    pub fn request(&self) -> JobRequest {
        JobRequest {
            job_id: self.job_id,
            conversation_id: self.conversation_id,
            job_type: self.job_type.clone(),
            model: self.model.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// The job holding the execution slot
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub job_id: JobId,
    pub conversation_id: i64,
    pub job_type: String,
    pub model: String,
    pub cancel: CancellationToken,
    /// Set by whoever claims the right to write the terminal state
    pub finalizing: bool,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Sorted by priority descending, then admission order
    pending: Vec<PendingJob>,
    pub processing: Option<ActiveJob>,
    pub current_model: Option<String>,
    pub shutting_down: bool,
    next_seq: u64,
}

impl QueueState {
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, job: PendingJob) {
        let index = self
            .pending
            .iter()
            .position(|queued| runs_before(&job, queued))
            .unwrap_or(self.pending.len());
        self.pending.insert(index, job);
    }

    pub fn pop_next(&mut self) -> Option<PendingJob> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<PendingJob> {
        let index = self.pending.iter().position(|job| job.job_id == job_id)?;
        Some(self.pending.remove(index))
    }

    pub fn drain_pending(&mut self) -> Vec<PendingJob> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.pending.iter().any(|job| job.job_id == job_id)
    }

    pub fn max_priority(&self) -> Option<i32> {
        self.pending.first().map(|job| job.priority)
    }

    /// Change a waiting job's priority and move it accordingly
    pub fn set_priority(&mut self, job_id: JobId, priority: i32) -> bool {
        match self.remove(job_id) {
            Some(mut job) => {
                job.priority = priority;
                self.push(job);
                true
            }
            None => false,
        }
    }

    /// 0 for the running job, n for the nth waiting job
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        if self.processing.as_ref().is_some_and(|active| active.job_id == job_id) {
            return Some(0);
        }
        self.pending.iter().position(|job| job.job_id == job_id).map(|index| index + 1)
    }

    pub fn snapshot(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.pending.len(),
            processing_job: self.processing.as_ref().map(|active| ProcessingJob {
                job_id: active.job_id,
                conversation_id: active.conversation_id,
                job_type: active.job_type.clone(),
                model: active.model.clone(),
                elapsed_ms: active.started_at.elapsed().as_millis() as u64,
            }),
            waiting_jobs: self
                .pending
                .iter()
                .enumerate()
                .map(|(index, job)| WaitingJob {
                    job_id: job.job_id,
                    conversation_id: job.conversation_id,
                    job_type: job.job_type.clone(),
                    model: job.model.clone(),
                    priority: job.priority,
                    position: index + 1,
                })
                .collect(),
            current_model: self.current_model.clone(),
        }
    }
}

fn runs_before(job: &PendingJob, other: &PendingJob) -> bool {
    job.priority > other.priority || (job.priority == other.priority && job.seq < other.seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(state: &mut QueueState, priority: i32) -> JobId {
        let job = PendingJob {
            job_id: JobId::new(),
            conversation_id: 1,
            job_type: "chat".into(),
            model: "llama3.2:3b".into(),
            payload: serde_json::json!({}),
            priority,
            seq: state.next_seq(),
            enqueued_at: Instant::now(),
        };
        let job_id = job.job_id;
        state.push(job);
        job_id
    }

    #[test]
    fn test_priority_then_admission_order() {
        let mut state = QueueState::default();
        let low = pending(&mut state, 0);
        let high = pending(&mut state, 5);
        let low2 = pending(&mut state, 0);
        let high2 = pending(&mut state, 5);

        let order: Vec<JobId> = std::iter::from_fn(|| state.pop_next().map(|j| j.job_id)).collect();
        assert_eq!(order, vec![high, high2, low, low2]);
    }

    #[test]
    fn test_set_priority_moves_job_to_front() {
        let mut state = QueueState::default();
        let a = pending(&mut state, 0);
        let b = pending(&mut state, 0);
        let c = pending(&mut state, 0);

        let top = state.max_priority().unwrap() + 1;
        assert!(state.set_priority(c, top));
        assert!(!state.set_priority(JobId::new(), top));

        assert_eq!(state.position(c), Some(1));
        assert_eq!(state.position(a), Some(2));
        assert_eq!(state.position(b), Some(3));
    }

    #[test]
    fn test_position_of_running_job_is_zero() {
        let mut state = QueueState::default();
        let first = pending(&mut state, 0);
        let second = pending(&mut state, 0);

        let job = state.pop_next().unwrap();
        state.processing = Some(ActiveJob {
            job_id: job.job_id,
            conversation_id: job.conversation_id,
            job_type: job.job_type,
            model: job.model,
            cancel: CancellationToken::new(),
            finalizing: false,
            started_at: Instant::now(),
        });

        assert_eq!(state.position(first), Some(0));
        assert_eq!(state.position(second), Some(1));
        assert_eq!(state.position(JobId::new()), None);

        let status = state.snapshot();
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.processing_job.map(|p| p.job_id), Some(first));
        assert_eq!(status.waiting_jobs[0].position, 1);
    }
}
