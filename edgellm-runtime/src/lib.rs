//! EdgeLLM Runtime Library
//!
//! Host process for the EdgeLLM queue: opens the job database, recovers
//! from an unclean shutdown, connects the queue to Ollama and keeps the
//! background sweeper running.
//!
//! HTTP routes live elsewhere; they hold a [`QueueManager`] obtained from
//! [`Runtime::manager`].
//!
//! # Example
//! ```no_run
//! use edgellm_runtime::{Runtime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::start(RuntimeConfig::from_env()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use edgellm_core::{
    InferenceBackend, JobStore, ModelResolver, QueueEvent, QueueManager, StreamBroker,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod ndjson;
pub mod ollama;
pub mod types;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use ollama::OllamaClient;

/// A running queue with its background tasks
pub struct Runtime {
    config: RuntimeConfig,
    manager: QueueManager,
    ollama: Arc<OllamaClient>,
    cleanup_task: JoinHandle<()>,
    event_logger: JoinHandle<()>,
}

impl Runtime {
    /// Open the database named in `config` and start the queue
    pub async fn start(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let pool = connect(&config).await?;
        let ollama = OllamaClient::new(&config)?;
        Self::from_parts(config, pool, ollama).await
    }

    /// Start the queue on an existing pool and client.
    ///
    /// Migrates the schema and fails every job a previous process left
    /// unfinished before admitting anything new.
    pub async fn from_parts(
        config: RuntimeConfig,
        pool: SqlitePool,
        ollama: OllamaClient,
    ) -> Result<Self, RuntimeError> {
        info!(
            ollama_url = %config.ollama_url,
            database = %config.database_url,
            default_model = %config.default_model,
            "Starting EdgeLLM runtime v{}",
            env!("CARGO_PKG_VERSION")
        );

        let store = Arc::new(JobStore::new(pool, config.store.clone()));
        store.migrate().await?;

        let recovered = store.fail_interrupted_jobs().await?;
        if recovered > 0 {
            warn!(recovered, "Failed jobs left unfinished by the previous run");
        }

        // Check Ollama connectivity
        match ollama.health_check().await {
            Ok(()) => info!("Connected to Ollama at {}", config.ollama_url),
            Err(e) => {
                warn!(
                    "Could not connect to Ollama at {}: {}. \
                     Jobs will fail until it comes up.",
                    config.ollama_url, e
                );
            }
        }

        let ollama = Arc::new(ollama);
        let manager = QueueManager::new(
            config.queue.clone(),
            store,
            StreamBroker::new(),
            Arc::clone(&ollama) as Arc<dyn InferenceBackend>,
            Arc::clone(&ollama) as Arc<dyn ModelResolver>,
        );
        let cleanup_task = manager.spawn_cleanup_task();
        let event_logger = spawn_event_logger(manager.events());

        Ok(Self { config, manager, ollama, cleanup_task, event_logger })
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn ollama(&self) -> &Arc<OllamaClient> {
        &self.ollama
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Cancel all work and stop the background tasks
    pub async fn shutdown(self) {
        self.manager.shutdown().await;

        if tokio::time::timeout(Duration::from_secs(5), self.cleanup_task).await.is_err() {
            warn!("Cleanup task did not stop in time");
        }
        self.event_logger.abort();

        let metrics = self.manager.metrics().snapshot();
        info!(
            completed = metrics.jobs_completed,
            failed = metrics.jobs_failed,
            cancelled = metrics.jobs_cancelled,
            "EdgeLLM runtime stopped"
        );
    }
}

/// Open the SQLite pool described by `config`.
///
/// Every connection to `sqlite::memory:` is its own database, so in-memory
/// pools hold exactly one connection that never expires.
pub async fn connect(config: &RuntimeConfig) -> Result<SqlitePool, RuntimeError> {
    let options = if config.is_in_memory_database() {
        SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.database_max_connections.max(1))
    };

    let pool = options.connect(&config.database_url).await?;
    debug!(database = %config.database_url, "Database pool ready");
    Ok(pool)
}

/// Log queue-wide events until the receiver is closed
pub fn spawn_event_logger(mut events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::ModelSwitching { job_id, from, to }) => {
                    info!(
                        job_id = %job_id,
                        from = from.as_deref().unwrap_or("none"),
                        to = %to,
                        "Model switch requested"
                    );
                }
                Ok(QueueEvent::ModelSwitched { job_id, model }) => {
                    info!(job_id = %job_id, model = %model, "Model ready");
                }
                Ok(QueueEvent::QueueUpdated { status }) => {
                    debug!(
                        waiting = status.queue_length,
                        running = status.processing_job.is_some(),
                        "Queue updated"
                    );
                }
                Ok(QueueEvent::JobStarted { .. }) | Ok(QueueEvent::JobFinished { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Queue event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Print the startup banner
pub fn print_banner(config: &RuntimeConfig) {
    println!();
    println!("==================================================");
    println!("  EdgeLLM Runtime v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Ollama backend: {}", config.ollama_url);
    println!("  Database:       {}", config.database_url);
    println!("  Default model:  {}", config.default_model);
    println!();
    println!("  Queue configuration:");
    println!("    Max waiting jobs: {}", config.queue.max_queue_length);
    println!("    Job timeout: {}s", config.queue.job_timeout.as_secs());
    println!(
        "    Stale after: {}s (swept every {}s)",
        config.store.stale_after.as_secs(),
        config.queue.cleanup_interval.as_secs()
    );
    println!("==================================================");
    println!();
}
