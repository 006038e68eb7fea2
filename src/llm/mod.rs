//! LLM client traits and implementations.
//!
//! This module provides the boundary between the chat core and a remote
//! completion endpoint. The [`ChatClient`] trait exposes a one-shot
//! completion and a streaming completion; the [`ChatOrchestrator`] builds on
//! top of a client to keep per-session history consistent.
//!
//! # Clients
//!
//! - [`ChatCompletionsClient`]: OpenAI-compatible Chat Completions API
//!   (`{base_url}/chat/completions`)
//!
//! # Example
//!
//! ```rust,ignore
//! use session_chat::llm::{ChatCompletionsClient, LlmSettings};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com/v1".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     temperature: 0.5,
//!     max_tokens: None,
//!     timeout: std::time::Duration::from_secs(120),
//! };
//! let client = ChatCompletionsClient::new(settings)?;
//! ```

pub mod chat_completions;
pub mod orchestrator;

pub use chat_completions::ChatCompletionsClient;
pub use orchestrator::{ChatError, ChatOrchestrator};

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

/// LLM connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the API, including any version prefix (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Optional API key for bearer authentication.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens, if any.
    pub max_tokens: Option<u32>,
    /// Request timeout applied by the HTTP client.
    pub timeout: Duration,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
}

impl MessageRole {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// One decoded unit of a provider's streaming response.
///
/// Clients are responsible for turning whatever the provider sends into this
/// shape: `cumulative_content` is the full reply text produced so far (not a
/// delta), and `reasoning` is whatever side-channel reasoning the provider
/// attached to this particular frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFrame {
    /// Reasoning text carried by this frame, if any.
    pub reasoning: Option<String>,
    /// Reply text accumulated up to and including this frame.
    pub cumulative_content: Option<String>,
}

/// Boxed stream of frames returned by [`ChatClient::stream`].
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, LlmError>> + Send>>;

/// Errors raised by a remote completion client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// A response body or stream chunk was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider reported an error inside an otherwise valid response.
    #[error("provider error: {0}")]
    Provider(String),

    /// The response was valid JSON but missing required fields.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Trait for remote chat-completion clients.
///
/// Implementations see the full ordered history of a session and either
/// return the whole reply or a lazy stream of [`StreamFrame`]s.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Request a complete reply for the given history.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be read.
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// Open a streaming reply for the given history.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened. Failures while
    /// consuming the stream are reported as `Err` items.
    async fn stream(&self, messages: &[Message]) -> Result<FrameStream, LlmError>;
}
