//! Single-flight admission queue in front of the inference backend.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::QueueConfig;
use super::events::{QueueEvent, QueueStatus};
use super::metrics::QueueMetrics;
use super::state::{ActiveJob, PendingJob, QueueState};
use crate::backend::{BackendChunk, InferenceBackend, ModelResolver};
use crate::broker::{deliver, Callback, StreamBroker, StreamEvent, Subscription};
use crate::error::{BackendError, JobStoreError, QueueError};
use crate::jobs::{Job, JobId, JobStatus, JobStore};

/// Per-request options for [`QueueManager::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first; ties run in admission order
    pub priority: i32,
    /// Requested model; the resolver falls back to its default when `None`
    pub model: Option<String>,
}

/// Returned by a successful [`QueueManager::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub job_id: JobId,
    pub message_id: i64,
    /// 0 when the job started right away
    pub queue_position: usize,
    pub model: String,
}

/// How a job's execution ended, before it is persisted
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn status(&self) -> JobStatus {
        match self {
            Outcome::Completed => JobStatus::Completed,
            Outcome::Failed(_) => JobStatus::Error,
            Outcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

enum CancelTarget {
    Pending(PendingJob),
    Active(CancellationToken),
    Nothing,
}

struct Inner {
    config: QueueConfig,
    store: Arc<JobStore>,
    broker: StreamBroker,
    backend: Arc<dyn InferenceBackend>,
    resolver: Arc<dyn ModelResolver>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    metrics: Arc<QueueMetrics>,
    shutdown: CancellationToken,
}

/// Serializes inference jobs so exactly one runs at a time.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        store: Arc<JobStore>,
        broker: StreamBroker,
        backend: Arc<dyn InferenceBackend>,
        resolver: Arc<dyn ModelResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                broker,
                backend,
                resolver,
                state: Mutex::new(QueueState::default()),
                events,
                metrics: Arc::new(QueueMetrics::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.inner.broker
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.inner.metrics
    }

    /// Receiver for queue-wide notifications
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Admit a job and start it if nothing else is running.
    ///
    /// Validation and capacity are checked before anything is persisted.
    pub async fn enqueue(
        &self,
        conversation_id: i64,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        if job_type.trim().is_empty() {
            return Err(QueueError::validation("job type must not be empty"));
        }
        if !payload.is_object() {
            return Err(QueueError::validation("payload must be a JSON object"));
        }

        {
            let state = self.lock_state();
            if state.shutting_down {
                return Err(QueueError::Shutdown);
            }
            if state.pending_len() >= self.inner.config.max_queue_length {
                self.inner.metrics.record_rejected();
                warn!(max = self.inner.config.max_queue_length, "Queue full, rejecting job");
                return Err(QueueError::QueueFull { max: self.inner.config.max_queue_length });
            }
        }

        let model = self.inner.resolver.resolve_model(options.model.as_deref()).await?;
        let created = self
            .inner
            .store
            .create_job(conversation_id, job_type, &model, options.priority)
            .await?;
        self.inner.metrics.record_received();

        // Capacity is checked again: other enqueues may have landed meanwhile
        let rejection = {
            let mut state = self.lock_state();
            if state.shutting_down {
                Some(QueueError::Shutdown)
            } else if state.pending_len() >= self.inner.config.max_queue_length {
                self.inner.metrics.record_rejected();
                Some(QueueError::QueueFull { max: self.inner.config.max_queue_length })
            } else {
                let seq = state.next_seq();
                state.push(PendingJob {
                    job_id: created.job_id,
                    conversation_id,
                    job_type: job_type.to_string(),
                    model: model.clone(),
                    payload,
                    priority: options.priority,
                    seq,
                    enqueued_at: Instant::now(),
                });
                self.inner.metrics.record_queued();
                None
            }
        };

        if let Some(err) = rejection {
            warn!(job_id = %created.job_id, error = %err, "Job created but not admitted");
            self.inner.store.cancel_job(created.job_id).await?;
            return Err(err);
        }

        info!(
            job_id = %created.job_id,
            conversation_id,
            model = %model,
            priority = options.priority,
            "Job enqueued"
        );

        self.emit_queue_update();
        self.process_next();

        let queue_position = self.lock_state().position(created.job_id).unwrap_or(0);
        Ok(EnqueueResult {
            job_id: created.job_id,
            message_id: created.message_id,
            queue_position,
            model,
        })
    }

    /// Start the next waiting job if the execution slot is free.
    ///
    /// The slot is claimed under the lock before the job task is spawned, so
    /// concurrent callers cannot start two jobs.
    fn process_next(&self) {
        let (job, cancel) = {
            let mut state = self.lock_state();
            if state.processing.is_some() || state.shutting_down {
                return;
            }
            let Some(job) = state.pop_next() else {
                return;
            };
            let cancel = CancellationToken::new();
            state.processing = Some(ActiveJob {
                job_id: job.job_id,
                conversation_id: job.conversation_id,
                job_type: job.job_type.clone(),
                model: job.model.clone(),
                cancel: cancel.clone(),
                finalizing: false,
                started_at: Instant::now(),
            });
            (job, cancel)
        };

        self.inner.metrics.record_started(job.enqueued_at.elapsed());
        let manager = self.clone();
        tokio::spawn(async move { manager.run_job(job, cancel).await });
    }

    async fn run_job(self, job: PendingJob, cancel: CancellationToken) {
        let job_id = job.job_id;
        self.inner.store.register_stream(job_id, cancel.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(self.inner.config.job_timeout) => Outcome::Failed(format!(
                "Job timed out after {:?}",
                self.inner.config.job_timeout
            )),
            outcome = self.execute(&job) => outcome,
        };

        self.finalize(job_id, outcome).await;
    }

    async fn execute(&self, job: &PendingJob) -> Outcome {
        let job_id = job.job_id;

        if let Err(err) = self.inner.store.start_job(job_id).await {
            return Outcome::Failed(format!("Failed to start job: {}", err));
        }
        info!(job_id = %job_id, model = %job.model, "Job started");
        self.notify(job_id, &StreamEvent::JobStarted { job_id, model: job.model.clone() });
        self.emit(QueueEvent::JobStarted { job_id, model: job.model.clone() });

        if let Err(err) = self.ensure_model(job).await {
            return Outcome::Failed(format!("Failed to load model {}: {}", job.model, err));
        }

        let mut stream = match self.inner.backend.stream(&job.request()).await {
            Ok(stream) => stream,
            Err(err) => return Outcome::Failed(err.to_string()),
        };

        let mut streaming = false;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return Outcome::Failed(err.to_string()),
            };
            if let Err(err) = self.apply_chunk(job_id, chunk, &mut streaming).await {
                return Outcome::Failed(format!("Failed to persist output: {}", err));
            }
        }

        Outcome::Completed
    }

    /// Load the job's model if a different one is resident
    async fn ensure_model(&self, job: &PendingJob) -> Result<(), BackendError> {
        let loaded = self.inner.resolver.loaded_model().await?;

        if loaded.as_deref() != Some(job.model.as_str()) {
            info!(
                job_id = %job.job_id,
                from = loaded.as_deref().unwrap_or("none"),
                to = %job.model,
                "Switching model"
            );
            self.emit(QueueEvent::ModelSwitching {
                job_id: job.job_id,
                from: loaded,
                to: job.model.clone(),
            });
            self.notify(
                job.job_id,
                &StreamEvent::status("model_switching", Some(format!("Loading {}", job.model))),
            );
            self.inner.metrics.record_model_switch();

            self.inner.resolver.switch_model(&job.model).await?;
            self.emit(QueueEvent::ModelSwitched { job_id: job.job_id, model: job.model.clone() });
        }

        self.lock_state().current_model = Some(job.model.clone());
        Ok(())
    }

    /// Persist a chunk, then fan it out
    async fn apply_chunk(
        &self,
        job_id: JobId,
        chunk: BackendChunk,
        streaming: &mut bool,
    ) -> Result<(), JobStoreError> {
        let store = &self.inner.store;

        match chunk {
            BackendChunk::Token { content, thinking } => {
                let thinking = thinking.filter(|t| !t.is_empty());
                if content.is_empty() && thinking.is_none() {
                    return Ok(());
                }
                if !*streaming {
                    store.mark_streaming(job_id).await?;
                    *streaming = true;
                }
                store
                    .update_job_content(job_id, Some(&content), thinking.as_deref(), None)
                    .await?;
                self.notify(job_id, &StreamEvent::Response { token: content, thinking });
            }
            BackendChunk::Sources(sources) => {
                store.update_job_content(job_id, None, None, Some(&sources)).await?;
                self.notify(job_id, &StreamEvent::Sources { sources });
            }
            BackendChunk::MatchedSpaces(spaces) => {
                self.notify(job_id, &StreamEvent::MatchedSpaces { spaces });
            }
            BackendChunk::Status { phase, message } => {
                self.notify(job_id, &StreamEvent::Status { phase, message });
            }
        }
        Ok(())
    }

    /// Persist the outcome unless a cancellation already claimed the job
    async fn finalize(&self, job_id: JobId, outcome: Outcome) {
        let claimed = {
            let mut state = self.lock_state();
            match state.processing.as_mut() {
                Some(active) if active.job_id == job_id && !active.finalizing => {
                    active.finalizing = true;
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            debug!(job_id = %job_id, "Job already finalized elsewhere");
            // A cancel can land before run_job registers the stream
            self.inner.store.clear_stream(job_id);
            return;
        }

        let store = &self.inner.store;
        let persisted = match &outcome {
            Outcome::Completed => store.complete_job(job_id).await,
            Outcome::Failed(message) => {
                warn!(job_id = %job_id, error = %message, "Job failed");
                store.error_job(job_id, message).await
            }
            Outcome::Cancelled => store.cancel_job(job_id).await.map(|_| ()),
        };

        let mut status = outcome.status();
        if let Err(err) = persisted {
            error!(job_id = %job_id, error = %err, "Failed to persist job outcome");
            if status == JobStatus::Completed {
                let message = format!("Failed to persist completion: {}", err);
                if let Err(err) = store.error_job(job_id, &message).await {
                    error!(job_id = %job_id, error = %err, "Failed to mark job as error");
                }
                status = JobStatus::Error;
            }
        }

        self.on_job_complete(job_id, status).await;
    }

    /// Release the slot, close the job's streams and start the next job
    async fn on_job_complete(&self, job_id: JobId, fallback: JobStatus) {
        let processing_time = {
            let mut state = self.lock_state();
            match state.processing.take() {
                Some(active) if active.job_id == job_id => Some(active.started_at.elapsed()),
                other => {
                    state.processing = other;
                    None
                }
            }
        };
        self.inner.store.clear_stream(job_id);

        let job = match self.inner.store.get_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Could not read final job state");
                None
            }
        };
        let events = match &job {
            Some(job) => StreamEvent::terminal(job),
            None => {
                vec![StreamEvent::Done {
                    status: fallback,
                    content: String::new(),
                    thinking: String::new(),
                    sources: None,
                    error_message: None,
                }]
            }
        };
        let status = job.as_ref().map_or(fallback, |job| job.status);

        let listeners = self.inner.broker.finish_job(job_id, &events);
        self.inner.metrics.record_finished(status, processing_time);
        info!(job_id = %job_id, status = %status, listeners, "Job finished");

        self.emit(QueueEvent::JobFinished { job_id, status });
        self.emit_queue_update();
        self.process_next();
    }

    /// Raise a waiting job above every other waiting job.
    ///
    /// Jobs that are running, finished or unknown are left alone.
    pub async fn prioritize_job(&self, job_id: JobId) -> Result<(), QueueError> {
        let priority = {
            let mut state = self.lock_state();
            if !state.is_pending(job_id) {
                debug!(job_id = %job_id, "Prioritize ignored, job is not waiting");
                return Ok(());
            }
            let priority = state.max_priority().unwrap_or(0).saturating_add(1);
            state.set_priority(job_id, priority);
            priority
        };

        self.inner.store.set_priority(job_id, priority).await?;
        info!(job_id = %job_id, priority, "Job prioritized");
        self.emit_queue_update();
        Ok(())
    }

    /// Cancel a waiting or running job.
    ///
    /// A running job's backend call is aborted and the next job starts
    /// without waiting for it to unwind. Returns `false` when there was
    /// nothing to cancel.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, QueueError> {
        let target = {
            let mut state = self.lock_state();
            if let Some(job) = state.remove(job_id) {
                CancelTarget::Pending(job)
            } else {
                match state.processing.as_mut() {
                    Some(active) if active.job_id == job_id && !active.finalizing => {
                        active.finalizing = true;
                        CancelTarget::Active(active.cancel.clone())
                    }
                    _ => CancelTarget::Nothing,
                }
            }
        };

        match target {
            CancelTarget::Pending(job) => {
                self.inner.metrics.record_withdrawn();
                let result = self.inner.store.cancel_job(job.job_id).await;
                info!(job_id = %job_id, "Waiting job cancelled");
                self.on_job_complete(job_id, JobStatus::Cancelled).await;
                result.map(|_| true).map_err(QueueError::from)
            }
            CancelTarget::Active(token) => {
                token.cancel();
                let result = self.inner.store.cancel_job(job_id).await;
                if let Err(err) = &result {
                    error!(job_id = %job_id, error = %err, "Failed to persist cancellation");
                }
                info!(job_id = %job_id, "Running job cancelled");
                self.on_job_complete(job_id, JobStatus::Cancelled).await;
                result.map(|_| true).map_err(QueueError::from)
            }
            CancelTarget::Nothing => {
                debug!(job_id = %job_id, "Cancel ignored, job is not queued or running");
                Ok(false)
            }
        }
    }

    /// Attach a listener to a job.
    ///
    /// The listener is registered before the persisted state is read. A job
    /// that already finished is replayed as `reconnect` plus its terminal
    /// events, exactly once. A running job with output gets a `reconnect`
    /// snapshot followed by live events; a delta persisted between
    /// registration and the read can show up in both.
    pub async fn subscribe_to_job<F>(
        &self,
        job_id: JobId,
        callback: F,
    ) -> Result<Subscription, QueueError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let subscription = self.inner.broker.subscribe_callback(job_id, Arc::clone(&callback));

        let job = match self.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                subscription.unsubscribe();
                return Err(JobStoreError::NotFound(job_id).into());
            }
            Err(err) => {
                subscription.unsubscribe();
                return Err(err);
            }
        };

        if job.is_terminal() {
            // Losing the race to finish_job means it already delivered.
            if self.inner.broker.remove(&subscription) {
                debug!(job_id = %job_id, "Replaying finished job to late subscriber");
                deliver(job_id, &callback, &StreamEvent::reconnect(&job));
                for event in StreamEvent::terminal(&job) {
                    deliver(job_id, &callback, &event);
                }
            }
        } else if !job.content.is_empty() || !job.thinking.is_empty() || job.sources.is_some() {
            deliver(job_id, &callback, &StreamEvent::reconnect(&job));
        }

        Ok(subscription)
    }

    /// Channel flavour of [`subscribe_to_job`](Self::subscribe_to_job)
    pub async fn subscribe_channel(
        &self,
        job_id: JobId,
    ) -> Result<(Subscription, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>), QueueError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = self
            .subscribe_to_job(job_id, move |event| {
                let _ = tx.send(event.clone());
            })
            .await?;
        Ok((subscription, rx))
    }

    /// Persisted job with its current queue position filled in
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let mut job = self.inner.store.get_job(job_id).await?;
        if let Some(job) = job.as_mut() {
            job.queue_position = self.lock_state().position(job_id);
        }
        Ok(job)
    }

    /// Read-only snapshot of the queue
    pub fn get_queue_status(&self) -> QueueStatus {
        self.lock_state().snapshot()
    }

    pub async fn cleanup_stale_jobs(&self) -> Result<usize, QueueError> {
        Ok(self.inner.store.cleanup_stale_jobs().await?)
    }

    /// Sweep stale jobs every `cleanup_interval` until shutdown
    pub fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = manager.inner.config.cleanup_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.cleanup_stale_jobs().await {
                            warn!(error = %err, "Stale job cleanup failed");
                        }
                    }
                }
            }
            debug!("Stale job cleanup task stopped");
        })
    }

    /// Stop admitting jobs and cancel everything queued or running
    pub async fn shutdown(&self) {
        let (pending, active) = {
            let mut state = self.lock_state();
            state.shutting_down = true;
            let pending: Vec<JobId> = state.drain_pending().iter().map(|job| job.job_id).collect();
            let active = state.processing.as_ref().map(|active| active.job_id);
            (pending, active)
        };
        self.inner.shutdown.cancel();

        info!(waiting = pending.len(), running = active.is_some(), "Queue shutting down");

        for job_id in pending {
            self.inner.metrics.record_withdrawn();
            if let Err(err) = self.inner.store.cancel_job(job_id).await {
                warn!(job_id = %job_id, error = %err, "Failed to cancel waiting job");
            }
            self.on_job_complete(job_id, JobStatus::Cancelled).await;
        }
        if let Some(job_id) = active {
            if let Err(err) = self.cancel_job(job_id).await {
                warn!(job_id = %job_id, error = %err, "Failed to cancel running job");
            }
        }
    }

    fn notify(&self, job_id: JobId, event: &StreamEvent) {
        self.inner.broker.notify_subscribers(job_id, event);
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn emit_queue_update(&self) {
        let status = self.get_queue_status();
        self.emit(QueueEvent::QueueUpdated { status });
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
