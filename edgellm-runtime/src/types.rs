//! Ollama API types.
//!
//! Only the endpoints the runtime talks to:
//! https://github.com/ollama/ollama/blob/main/docs/api.md
//!
//! [`JobPayload`] is the shape callers put in a job's payload for `chat`
//! and `rag` jobs.

use edgellm_core::{BackendChunk, BackendError};
use serde::{Deserialize, Serialize};

/// Request body for POST /api/chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name (required)
    pub model: String,

    /// Chat messages, oldest first
    pub messages: Vec<Message>,

    /// Always true for queue jobs
    pub stream: bool,

    /// Model-specific options, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,

    /// Ask reasoning models to emit their thinking separately
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,

    /// How long to keep the model loaded afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user", "assistant" or "tool"
    pub role: String,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into(), thinking: None }
    }
}

/// One NDJSON line of a streaming /api/chat response
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub message: Option<Message>,

    #[serde(default)]
    pub done: bool,

    #[serde(default)]
    pub done_reason: Option<String>,

    /// Set when Ollama aborts mid-stream
    #[serde(default)]
    pub error: Option<String>,
}

impl ChatChunk {
    /// Convert to queue output; `None` for lines that carry nothing
    pub fn into_backend_chunk(self) -> Result<Option<BackendChunk>, BackendError> {
        if let Some(error) = self.error {
            return Err(BackendError::model(error));
        }

        let Some(message) = self.message else {
            return Ok(None);
        };
        let thinking = message.thinking.filter(|t| !t.is_empty());
        if message.content.is_empty() && thinking.is_none() {
            return Ok(None);
        }
        Ok(Some(BackendChunk::Token { content: message.content, thinking }))
    }
}

/// Request body for POST /api/generate, used only to load and unload models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,

    /// Empty prompt: Ollama loads the model and returns immediately
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    pub stream: bool,

    /// Duration string ("30m") or 0 to unload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<serde_json::Value>,
}

impl GenerateRequest {
    /// Request that loads `model` and keeps it resident for `keep_alive`
    pub fn load(model: impl Into<String>, keep_alive: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: None,
            stream: false,
            keep_alive: Some(serde_json::Value::String(keep_alive.into())),
        }
    }

    /// Request that evicts `model` from memory
    pub fn unload(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: None,
            stream: false,
            keep_alive: Some(serde_json::Value::from(0)),
        }
    }
}

/// Response from GET /api/tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsResponse {
    /// Installed models
    pub models: Vec<ModelInfo>,
}

/// Installed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub digest: String,
}

/// Response from GET /api/ps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsResponse {
    /// Models currently loaded in memory
    pub models: Vec<RunningModel>,
}

/// Loaded model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningModel {
    pub name: String,

    /// Bytes resident in accelerator memory
    #[serde(default)]
    pub size_vram: u64,

    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Payload of a `chat` or `rag` job.
///
/// Retrieval happens before the job is enqueued, so `sources` and
/// `matched_spaces` arrive ready to forward.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Shorthand for a single user message appended after `messages`
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub system: Option<String>,

    #[serde(default)]
    pub options: Option<serde_json::Value>,

    #[serde(default)]
    pub think: Option<bool>,

    #[serde(default)]
    pub sources: Option<serde_json::Value>,

    #[serde(default)]
    pub matched_spaces: Option<serde_json::Value>,
}

impl JobPayload {
    /// Build the streaming chat request for `model`
    pub fn chat_request(
        &self,
        model: &str,
        keep_alive: &str,
    ) -> Result<ChatRequest, BackendError> {
        let mut messages = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system) = self.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(Message::new("system", system));
        }
        messages.extend(self.messages.iter().cloned());
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(Message::new("user", prompt));
        }

        if messages.iter().all(|m| m.role == "system") {
            return Err(BackendError::invalid_request("job payload has no user messages"));
        }

        Ok(ChatRequest {
            model: model.to_string(),
            messages,
            stream: true,
            options: self.options.clone(),
            think: self.think,
            keep_alive: Some(keep_alive.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_chunk_token() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "model": "llama3.2:3b",
            "created_at": "2025-01-01T00:00:00Z",
            "message": { "role": "assistant", "content": "Hel" },
            "done": false
        }))
        .unwrap();

        assert_eq!(chunk.into_backend_chunk().unwrap(), Some(BackendChunk::token("Hel")));
    }

    #[test]
    fn test_chat_chunk_thinking_only() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "message": { "role": "assistant", "content": "", "thinking": "hmm" },
            "done": false
        }))
        .unwrap();

        assert_eq!(
            chunk.into_backend_chunk().unwrap(),
            Some(BackendChunk::Token { content: String::new(), thinking: Some("hmm".to_string()) })
        );
    }

    #[test]
    fn test_final_chunk_is_skipped() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "done_reason": "stop",
            "eval_count": 42
        }))
        .unwrap();

        assert!(chunk.done);
        assert_eq!(chunk.into_backend_chunk().unwrap(), None);
    }

    #[test]
    fn test_error_chunk() {
        let chunk: ChatChunk = serde_json::from_value(json!({ "error": "out of memory" })).unwrap();

        let err = chunk.into_backend_chunk().unwrap_err();
        assert_eq!(err, BackendError::model("out of memory"));
    }

    #[test]
    fn test_payload_to_chat_request() {
        let payload: JobPayload = serde_json::from_value(json!({
            "system": "Answer briefly.",
            "messages": [
                { "role": "user", "content": "Hi" },
                { "role": "assistant", "content": "Hello!" }
            ],
            "prompt": "What is Rust?",
            "options": { "temperature": 0.2 }
        }))
        .unwrap();

        let request = payload.chat_request("llama3.2:3b", "30m").unwrap();

        let roles: Vec<_> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(request.messages[3].content, "What is Rust?");
        assert!(request.stream);
        assert_eq!(request.keep_alive.as_deref(), Some("30m"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["temperature"], json!(0.2));
        assert!(json.get("think").is_none());
    }

    #[test]
    fn test_payload_without_messages_is_rejected() {
        let payload = JobPayload { system: Some("Be nice".to_string()), ..Default::default() };

        assert!(matches!(
            payload.chat_request("llama3.2:3b", "30m"),
            Err(BackendError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_unload_request() {
        let json = serde_json::to_value(GenerateRequest::unload("qwen2.5:7b")).unwrap();
        assert_eq!(json, json!({ "model": "qwen2.5:7b", "stream": false, "keep_alive": 0 }));
    }
}
