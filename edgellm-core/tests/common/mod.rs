//! Shared fixtures for queue integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edgellm_core::{
    BackendChunk, BackendError, ChunkStream, InferenceBackend, JobRequest, JobStore,
    JobStoreConfig, ModelResolver, QueueConfig, QueueManager, StreamBroker, StreamEvent,
};
use futures::StreamExt;
use serde_json::{json, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::{mpsc, Semaphore};

pub const DEFAULT_MODEL: &str = "llama3.2:3b";

pub async fn create_test_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

pub async fn create_store() -> Arc<JobStore> {
    let store = JobStore::new(create_test_pool().await, JobStoreConfig::default());
    store.migrate().await.expect("Failed to migrate test database");
    Arc::new(store)
}

/// Decrements the live-stream gauge when the backend stream is dropped
struct StreamGuard {
    active: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted backend driven by the job payload.
///
/// Payload keys: `name` (recorded on start), `tokens` (emitted in order),
/// `thinking`, `sources`, `error` (stream fails after the tokens) and
/// `hold` (wait for [`FakeBackend::release`] before emitting anything).
pub struct FakeBackend {
    started: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
    dropped: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
            dropped: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `n` held jobs proceed
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Job names in the order the backend was called
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Highest number of streams that were ever live at once
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Streams dropped so far, finished or aborted
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn stream(&self, request: &JobRequest) -> Result<ChunkStream, BackendError> {
        let payload = &request.payload;
        let name = payload["name"].as_str().unwrap_or("unnamed").to_string();
        self.started.lock().unwrap().push(name);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let guard = StreamGuard { active: Arc::clone(&self.active), dropped: Arc::clone(&self.dropped) };

        let mut chunks: Vec<Result<BackendChunk, BackendError>> = Vec::new();
        if let Some(sources) = payload.get("sources") {
            chunks.push(Ok(BackendChunk::Sources(sources.clone())));
        }
        let thinking = payload["thinking"].as_str().map(str::to_string);
        if thinking.is_some() {
            chunks.push(Ok(BackendChunk::Token { content: String::new(), thinking }));
        }
        for token in payload["tokens"].as_array().into_iter().flatten() {
            chunks.push(Ok(BackendChunk::token(token.as_str().unwrap_or_default())));
        }
        if let Some(message) = payload["error"].as_str() {
            chunks.push(Err(BackendError::connection(message)));
        }

        let hold = payload["hold"].as_bool().unwrap_or(false);
        let gate = Arc::clone(&self.gate);
        let wait = async move {
            if hold {
                if let Ok(permit) = gate.acquire_owned().await {
                    permit.forget();
                }
            }
        };

        let stream = futures::stream::once(wait).flat_map(move |_| {
            let _alive = &guard;
            futures::stream::iter(std::mem::take(&mut chunks))
        });
        Ok(Box::pin(stream))
    }
}

/// Resolver that records switches instead of touching a runtime
pub struct FakeResolver {
    loaded: Mutex<Option<String>>,
    switches: Mutex<Vec<String>>,
    available: Vec<String>,
}

impl FakeResolver {
    pub fn new(loaded: Option<&str>) -> Self {
        Self {
            loaded: Mutex::new(loaded.map(str::to_string)),
            switches: Mutex::new(Vec::new()),
            available: vec![DEFAULT_MODEL.to_string(), "qwen2.5:7b".to_string()],
        }
    }

    pub fn switches(&self) -> Vec<String> {
        self.switches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelResolver for FakeResolver {
    async fn resolve_model(&self, requested: Option<&str>) -> Result<String, BackendError> {
        match requested {
            Some(model) if self.available.iter().any(|m| m == model) => Ok(model.to_string()),
            _ => Ok(DEFAULT_MODEL.to_string()),
        }
    }

    async fn loaded_model(&self) -> Result<Option<String>, BackendError> {
        Ok(self.loaded.lock().unwrap().clone())
    }

    async fn switch_model(&self, model: &str) -> Result<(), BackendError> {
        self.switches.lock().unwrap().push(model.to_string());
        *self.loaded.lock().unwrap() = Some(model.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub manager: QueueManager,
    pub store: Arc<JobStore>,
    pub backend: Arc<FakeBackend>,
    pub resolver: Arc<FakeResolver>,
}

pub async fn harness(config: QueueConfig) -> Harness {
    harness_with_model(config, Some(DEFAULT_MODEL)).await
}

pub async fn harness_with_model(config: QueueConfig, loaded: Option<&str>) -> Harness {
    let store = create_store().await;
    let backend = Arc::new(FakeBackend::new());
    let resolver = Arc::new(FakeResolver::new(loaded));
    let manager = QueueManager::new(
        config,
        Arc::clone(&store),
        StreamBroker::new(),
        Arc::clone(&backend) as Arc<dyn InferenceBackend>,
        Arc::clone(&resolver) as Arc<dyn ModelResolver>,
    );
    Harness { manager, store, backend, resolver }
}

pub fn payload(name: &str, tokens: &[&str]) -> Value {
    json!({ "name": name, "tokens": tokens })
}

pub fn held(name: &str, tokens: &[&str]) -> Value {
    json!({ "name": name, "tokens": tokens, "hold": true })
}

/// Collect events until `done`, the channel closes or five seconds pass
pub async fn wait_for_done(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = rx.recv().await {
            let done = event.is_done();
            events.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("Timed out waiting for done event");
    events
}

/// Poll `check` every 10ms for up to five seconds
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "Condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
