//! Runtime configuration.

use std::time::Duration;

use edgellm_core::{JobStoreConfig, QueueConfig};

/// Everything the host process needs to start
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Ollama base URL, without a trailing slash
    pub ollama_url: String,

    /// SQLite connection string
    pub database_url: String,

    /// Pool size for file-backed databases; in-memory databases use one
    pub database_max_connections: u32,

    /// Model used when a job does not ask for one it can have
    pub default_model: String,

    /// Timeout for metadata calls (`/api/tags`, `/api/ps`, unload)
    pub request_timeout: Duration,

    /// Timeout for loading a model into memory
    pub load_timeout: Duration,

    /// How long Ollama keeps a model resident after a job
    pub keep_alive: String,

    /// Enable verbose logging
    pub verbose: bool,

    pub queue: QueueConfig,
    pub store: JobStoreConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            database_url: "sqlite://edgellm.db?mode=rwc".to_string(),
            database_max_connections: 5,
            default_model: "llama3.2:3b".to_string(),
            request_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(300), // large models take minutes
            keep_alive: "30m".to_string(),
            verbose: false,
            queue: QueueConfig::default(),
            store: JobStoreConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            queue: QueueConfig::from_env(),
            store: JobStoreConfig::from_env(),
            ..Self::from_lookup(|key| std::env::var(key).ok())
        }
    }

    /// Runtime settings read through `lookup`; queue and store keep their
    /// defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("OLLAMA_HOST").or_else(|| lookup("OLLAMA_URL")) {
            config.ollama_url = normalize_url(&url);
        }
        if let Some(url) = lookup("EDGELLM_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(n) = lookup("EDGELLM_DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.database_max_connections = n;
        }
        if let Some(model) = lookup("EDGELLM_DEFAULT_MODEL").filter(|m| !m.trim().is_empty()) {
            config.default_model = model;
        }
        if let Some(secs) = lookup("EDGELLM_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("EDGELLM_LOAD_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.load_timeout = Duration::from_secs(secs);
        }
        if let Some(keep_alive) = lookup("EDGELLM_KEEP_ALIVE") {
            config.keep_alive = keep_alive;
        }
        config.verbose = lookup("EDGELLM_VERBOSE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        config
    }

    pub fn is_in_memory_database(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// `OLLAMA_HOST` is often given as `host:port` without a scheme
fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}
