//! Ollama client.
//!
//! Implements the queue's [`InferenceBackend`] and [`ModelResolver`] seams
//! against a local Ollama server. Every request goes through the client's
//! `ollama` resilience policy; a stream that already started is never
//! retried.

use std::time::Duration;

use async_trait::async_trait;
use edgellm_core::resilience::Retryable;
use edgellm_core::{
    BackendChunk, BackendError, ChunkStream, InferenceBackend, JobRequest, ModelResolver,
    ResiliencePolicy,
};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::error::from_reqwest;
use crate::ndjson;
use crate::types::{ChatChunk, ChatRequest, GenerateRequest, JobPayload, PsResponse, TagsResponse};

/// Ollama HTTP client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    default_model: String,
    keep_alive: String,
    request_timeout: Duration,
    load_timeout: Duration,
    policy: ResiliencePolicy,
}

impl OllamaClient {
    pub fn new(config: &RuntimeConfig) -> Result<Self, BackendError> {
        Self::with_policy(config, ResiliencePolicy::http("ollama"))
    }

    pub fn with_policy(
        config: &RuntimeConfig,
        policy: ResiliencePolicy,
    ) -> Result<Self, BackendError> {
        info!(url = %config.ollama_url, "Creating Ollama client");

        // No overall timeout: streams are bounded by the queue's job timeout
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            client,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            keep_alive: config.keep_alive.clone(),
            request_timeout: config.request_timeout,
            load_timeout: config.load_timeout,
            policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Check if Ollama is available
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), BackendError> {
        match self.list_models().await {
            Ok(_) => {
                info!("Ollama is healthy");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Ollama health check failed");
                Err(err)
            }
        }
    }

    /// Installed models
    #[instrument(skip(self))]
    pub async fn list_models(&self) -> Result<TagsResponse, BackendError> {
        let url = self.url("/api/tags");
        debug!(url = %url, "Listing models");

        let response = self.send(|| self.client.get(&url).timeout(self.request_timeout)).await?;
        let tags: TagsResponse = response.json().await.map_err(from_reqwest)?;

        debug!(count = tags.models.len(), "Found models");
        Ok(tags)
    }

    /// Models currently loaded in memory
    #[instrument(skip(self))]
    pub async fn running_models(&self) -> Result<PsResponse, BackendError> {
        let url = self.url("/api/ps");
        debug!(url = %url, "Listing loaded models");

        let response = self.send(|| self.client.get(&url).timeout(self.request_timeout)).await?;
        let ps: PsResponse = response.json().await.map_err(from_reqwest)?;

        debug!(count = ps.models.len(), "Found loaded models");
        Ok(ps)
    }

    /// Load `model` and keep it resident
    #[instrument(skip(self))]
    pub async fn load_model(&self, model: &str) -> Result<(), BackendError> {
        let url = self.url("/api/generate");
        let request = GenerateRequest::load(model, self.keep_alive.as_str());
        info!(model, "Loading model");

        self.send(|| self.client.post(&url).json(&request).timeout(self.load_timeout)).await?;
        info!(model, "Model loaded");
        Ok(())
    }

    /// Evict `model` from memory
    #[instrument(skip(self))]
    pub async fn unload_model(&self, model: &str) -> Result<(), BackendError> {
        let url = self.url("/api/generate");
        let request = GenerateRequest::unload(model);
        info!(model, "Unloading model");

        self.send(|| self.client.post(&url).json(&request).timeout(self.request_timeout)).await?;
        Ok(())
    }

    /// Start a streaming chat; the returned stream yields tokens as they
    /// arrive
    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError> {
        let url = self.url("/api/chat");
        debug!(url = %url, "Sending streaming chat request");

        let response = self.send(|| self.client.post(&url).json(request)).await?;
        let bytes = response.bytes_stream().map(|chunk| chunk.map_err(from_reqwest));

        let chunks = ndjson::decode::<ChatChunk, _>(bytes).filter_map(|line| {
            futures::future::ready(match line {
                Ok(chunk) => chunk.into_backend_chunk().transpose(),
                Err(err) => Some(Err(err)),
            })
        });
        Ok(Box::pin(chunks))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send with retries and the circuit breaker; non-2xx becomes an error.
    ///
    /// Only retryable failures (transport errors, 429, 5xx) count
    /// against the breaker.
    async fn send<F>(&self, build: F) -> Result<Response, BackendError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.policy
            .execute_classified(
                || {
                    let request = build();
                    async move {
                        let response = request.send().await.map_err(from_reqwest)?;
                        let status = response.status();
                        if status.is_success() {
                            return Ok(response);
                        }
                        let body = response.text().await.unwrap_or_default();
                        Err(BackendError::status(status.as_u16(), error_message(&body)))
                    }
                },
                |err: &BackendError| err.is_retryable(),
            )
            .await
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    #[instrument(skip(self, request), fields(job_id = %request.job_id, model = %request.model))]
    async fn stream(&self, request: &JobRequest) -> Result<ChunkStream, BackendError> {
        let payload: JobPayload = serde_json::from_value(request.payload.clone())
            .map_err(|e| BackendError::invalid_request(format!("invalid job payload: {}", e)))?;
        let chat = payload.chat_request(&request.model, &self.keep_alive)?;

        // Retrieval results go out before the first token
        let mut prelude = Vec::new();
        if let Some(spaces) = payload.matched_spaces {
            prelude.push(Ok(BackendChunk::MatchedSpaces(spaces)));
        }
        if let Some(sources) = payload.sources {
            prelude.push(Ok(BackendChunk::Sources(sources)));
        }

        let tokens = self.chat_stream(&chat).await?;
        Ok(Box::pin(futures::stream::iter(prelude).chain(tokens)))
    }
}

#[async_trait]
impl ModelResolver for OllamaClient {
    async fn resolve_model(&self, requested: Option<&str>) -> Result<String, BackendError> {
        let Some(requested) = requested.map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(self.default_model.clone());
        };

        match self.list_models().await {
            Ok(tags) if tags.models.iter().any(|m| same_model(&m.name, requested)) => {
                Ok(requested.to_string())
            }
            Ok(_) => {
                warn!(
                    requested,
                    default = %self.default_model,
                    "Requested model is not installed, using default"
                );
                Ok(self.default_model.clone())
            }
            Err(err) => {
                // The job fails later if the model really is missing
                warn!(requested, error = %err, "Could not list models, keeping requested model");
                Ok(requested.to_string())
            }
        }
    }

    async fn loaded_model(&self) -> Result<Option<String>, BackendError> {
        let ps = self.running_models().await?;
        Ok(ps.models.into_iter().next().map(|m| m.name))
    }

    #[instrument(skip(self))]
    async fn switch_model(&self, model: &str) -> Result<(), BackendError> {
        let running = self.running_models().await?;
        for resident in running.models.iter().filter(|m| !same_model(&m.name, model)) {
            self.unload_model(&resident.name).await?;
        }
        self.load_model(model).await
    }
}

/// `llama3.2` and `llama3.2:latest` name the same model
fn same_model(a: &str, b: &str) -> bool {
    fn with_tag(name: &str) -> std::borrow::Cow<'_, str> {
        if name.contains(':') {
            name.into()
        } else {
            format!("{}:latest", name).into()
        }
    }
    with_tag(a) == with_tag(b)
}

/// Ollama reports failures as `{"error": "..."}`
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
