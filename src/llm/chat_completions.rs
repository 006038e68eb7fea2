//! OpenAI-compatible Chat Completions client.
//!
//! This module implements [`ChatClient`] for any endpoint that speaks the
//! Chat Completions protocol (`{base_url}/chat/completions`). Streaming
//! responses arrive as incremental deltas; they are folded into cumulative
//! [`StreamFrame`]s here so the orchestrator never sees the wire shape.

use futures::StreamExt;
use serde::Deserialize;

use super::{ChatClient, FrameStream, LlmError, LlmSettings, Message, StreamFrame};

/// Client for the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsClient {
    /// Create a new client with the given settings.
    ///
    /// The configured timeout bounds connection setup for every request and
    /// the whole exchange for non-streaming requests. Streams are left open
    /// for as long as the provider keeps sending.
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .build()?;
        Ok(Self { http, settings })
    }

    /// Get the client settings.
    #[must_use]
    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, messages: &[Message], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let mut rb = self.http.post(self.url()).json(body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }
        if !stream {
            rb = rb.timeout(self.settings.timeout);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Provider rejected request");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl ChatClient for ChatCompletionsClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        tracing::debug!(
            model = %self.settings.model,
            message_count = messages.len(),
            "Sending completion request"
        );

        let body = self.request_body(messages, false);
        let resp = self.send(&body, false).await?;
        let text = resp.text().await?;
        let parsed: CompletionResponse = serde_json::from_str(&text)?;

        if let Some(err) = parsed.error {
            return Err(LlmError::Provider(describe_error(&err)));
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn stream(&self, messages: &[Message]) -> Result<FrameStream, LlmError> {
        tracing::debug!(
            model = %self.settings.model,
            message_count = messages.len(),
            "Opening completion stream"
        );

        let body = self.request_body(messages, true);
        let resp = self.send(&body, true).await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut decoder = FrameDecoder::default();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                for frame in decoder.push(&chunk)? {
                    yield frame;
                }
                if decoder.is_done() {
                    break;
                }
            }

            if !decoder.is_done() {
                for frame in decoder.finish()? {
                    yield frame;
                }
            }
        };

        Ok(Box::pin(out))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkEnvelope {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

/// Delta payload of a streamed chunk.
///
/// Providers disagree on where reasoning goes: `reasoning_content` (`DeepSeek`,
/// Qwen) or `reasoning` (`OpenRouter`).
#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Incremental SSE decoder that folds content deltas into cumulative text.
#[derive(Debug, Default)]
struct FrameDecoder {
    buf: Vec<u8>,
    content: String,
    done: bool,
}

impl FrameDecoder {
    /// Feed raw bytes; returns every frame completed by them.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamFrame>, LlmError> {
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while !self.done {
            let Some(pos) = find_double_newline(&self.buf) else {
                break;
            };
            let event = self.buf.drain(..pos + 2).collect::<Vec<_>>();
            self.decode_event(&event, &mut frames)?;
        }
        Ok(frames)
    }

    /// Flush whatever is left in the buffer once the body has ended.
    fn finish(&mut self) -> Result<Vec<StreamFrame>, LlmError> {
        let rest = std::mem::take(&mut self.buf);
        let mut frames = Vec::new();
        if !rest.is_empty() {
            self.decode_event(&rest, &mut frames)?;
        }
        self.done = true;
        Ok(frames)
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn decode_event(&mut self, event: &[u8], frames: &mut Vec<StreamFrame>) -> Result<(), LlmError> {
        let text = String::from_utf8_lossy(event);
        for line in text.lines() {
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.done = true;
                return Ok(());
            }
            if let Some(frame) = self.decode_chunk(data)? {
                frames.push(frame);
            }
        }
        Ok(())
    }

    fn decode_chunk(&mut self, data: &str) -> Result<Option<StreamFrame>, LlmError> {
        let chunk: ChunkEnvelope = serde_json::from_str(data)?;
        if let Some(err) = chunk.error {
            return Err(LlmError::Provider(describe_error(&err)));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        let delta = choice.delta;

        let reasoning = delta
            .reasoning_content
            .filter(|s| !s.is_empty())
            .or(delta.reasoning.filter(|s| !s.is_empty()));

        let grew = match delta.content {
            Some(text) if !text.is_empty() => {
                self.content.push_str(&text);
                true
            }
            _ => false,
        };

        if reasoning.is_none() && !grew {
            return Ok(None);
        }

        Ok(Some(StreamFrame {
            reasoning,
            cumulative_content: (!self.content.is_empty()).then(|| self.content.clone()),
        }))
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn describe_error(err: &serde_json::Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .map_or_else(|| err.to_string(), ToString::to_string)
}
