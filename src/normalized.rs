//! Typed events for streaming chat responses.
//!
//! The orchestrator yields [`StreamEvent`]s of kind `thinking` and `content`;
//! the HTTP boundary terminates every stream with exactly one `done` or
//! `error` event. Each event is sent as one SSE block whose `event:` name is
//! the kind and whose `data:` line is the JSON produced by
//! [`StreamEvent::to_json`].
//!
//! # Example
//!
//! ```rust
//! use session_chat::normalized::StreamEvent;
//!
//! let event = StreamEvent::content("Hello");
//! let json = event.to_json("s1");
//! assert_eq!(json["type"], "content");
//! assert_eq!(json["content"], "Hello");
//! ```

use serde::{Deserialize, Serialize};

/// Kind of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    /// Reasoning side-channel text, forwarded as the provider reported it.
    Thinking,
    /// Newly revealed suffix of the reply.
    Content,
    /// Stream completed normally.
    Done,
    /// Stream failed; payload holds the error description.
    Error,
}

impl StreamEventKind {
    /// SSE event name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Content => "content",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// One unit yielded while streaming a chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub payload: String,
}

impl StreamEvent {
    #[must_use]
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Thinking,
            payload: text.into(),
        }
    }

    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Content,
            payload: text.into(),
        }
    }

    #[must_use]
    pub fn done() -> Self {
        Self {
            kind: StreamEventKind::Done,
            payload: String::new(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Error,
            payload: message.into(),
        }
    }

    /// JSON body of the SSE `data:` line.
    ///
    /// Text-bearing events put the payload under `content`, errors under
    /// `error`, and `done` carries only the type and session.
    #[must_use]
    pub fn to_json(&self, session_id: &str) -> serde_json::Value {
        let kind = self.kind.as_str();
        match self.kind {
            StreamEventKind::Thinking | StreamEventKind::Content => serde_json::json!({
                "type": kind,
                "content": self.payload,
                "session_id": session_id,
            }),
            StreamEventKind::Done => serde_json::json!({
                "type": kind,
                "session_id": session_id,
            }),
            StreamEventKind::Error => serde_json::json!({
                "type": kind,
                "error": self.payload,
                "session_id": session_id,
            }),
        }
    }
}
