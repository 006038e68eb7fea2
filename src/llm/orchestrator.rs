//! Session-aware chat orchestration.
//!
//! The orchestrator owns the [`SessionStore`] and manages the lifecycle of a
//! single chat turn:
//! 1. Ensure the session exists (seeding the system prompt if it is new)
//! 2. Take the session's turn lock
//! 3. Append the user message
//! 4. Call the remote client with the full history
//! 5. Append the assistant reply, or roll the user message back on failure
//!
//! # Example
//!
//! ```rust,ignore
//! use session_chat::llm::{ChatCompletionsClient, ChatOrchestrator};
//! use session_chat::session::SessionStore;
//!
//! let client = Arc::new(ChatCompletionsClient::new(settings)?);
//! let orchestrator = ChatOrchestrator::new(client, SessionStore::new());
//!
//! let reply = orchestrator.chat("s1", "Hello!", Some("Be brief.")).await?;
//! ```

use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::normalized::StreamEvent;
use crate::session::{MessageView, Session, SessionStore, SessionSummary};

use super::{ChatClient, LlmError, Message, MessageRole};

/// Errors surfaced by [`ChatOrchestrator`] operations.
///
/// Whenever one of these is returned the pending user message has already
/// been removed from the session history.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The remote call failed before any reply text reached the caller.
    #[error("remote call failed: {0}")]
    RemoteCall(#[source] LlmError),

    /// The stream failed after reply text was already yielded.
    ///
    /// Fragments already delivered are not retracted, but the turn is still
    /// rolled back, so the caller may have shown text that is not in history.
    #[error("stream interrupted after {delivered_chars} characters: {source}")]
    StreamInterrupted {
        /// Characters of reply text yielded before the failure.
        delivered_chars: usize,
        #[source]
        source: LlmError,
    },
}

impl ChatError {
    /// Every variant originates from the remote client.
    #[must_use]
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::RemoteCall(_) | Self::StreamInterrupted { .. })
    }
}

/// Chat orchestrator over a remote completion client.
#[derive(Clone)]
pub struct ChatOrchestrator {
    client: Arc<dyn ChatClient>,
    sessions: SessionStore,
}

impl std::fmt::Debug for ChatOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOrchestrator")
            .field("client", &"dyn ChatClient")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ChatOrchestrator {
    /// Create a new orchestrator that owns `sessions`.
    pub fn new(client: Arc<dyn ChatClient>, sessions: SessionStore) -> Self {
        Self { client, sessions }
    }

    /// Get the session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Run one turn and return the complete reply.
    ///
    /// On failure the session history is left exactly as it was before the
    /// call, except that a session created by this call keeps its system
    /// prompt.
    pub async fn chat(
        &self,
        session_id: &str,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, ChatError> {
        let session = self.sessions.get_or_create(session_id, system_prompt);
        let _turn = session.lock_turn().await;
        let pending = PendingTurn::begin(&session, message);

        let history = session.messages();
        tracing::debug!(
            session_id = %session_id,
            history_len = history.len(),
            "Sending chat turn"
        );

        match self.client.complete(&history).await {
            Ok(reply) => {
                pending.commit(reply.clone());
                tracing::info!(
                    session_id = %session_id,
                    history_len = session.message_count(),
                    reply_length = reply.len(),
                    "Chat turn completed"
                );
                Ok(reply)
            }
            Err(e) => {
                drop(pending);
                tracing::error!(session_id = %session_id, error = %e, "Chat turn failed");
                Err(ChatError::RemoteCall(e))
            }
        }
    }

    /// Run one turn as a lazy stream of `thinking` and `content` events.
    ///
    /// Nothing happens until the stream is polled. A failure is reported as
    /// a single `Err` item after which the stream ends; the boundary is
    /// expected to turn it into an `error` event. Dropping the stream before
    /// it finishes releases the remote connection and rolls the turn back.
    pub fn chat_stream(
        &self,
        session_id: impl Into<String>,
        message: impl Into<String>,
        system_prompt: Option<String>,
    ) -> impl Stream<Item = Result<StreamEvent, ChatError>> + Send + 'static {
        let sessions = self.sessions.clone();
        let client = Arc::clone(&self.client);
        let session_id = session_id.into();
        let message = message.into();

        async_stream::stream! {
            let session = sessions.get_or_create(&session_id, system_prompt.as_deref());
            let _turn = session.lock_turn().await;
            let pending = PendingTurn::begin(&session, &message);

            let history = session.messages();
            tracing::debug!(
                session_id = %session_id,
                history_len = history.len(),
                "Opening chat stream"
            );

            let mut frames = match client.stream(&history).await {
                Ok(frames) => frames,
                Err(e) => {
                    drop(pending);
                    tracing::error!(session_id = %session_id, error = %e, "Failed to open chat stream");
                    yield Err(ChatError::RemoteCall(e));
                    return;
                }
            };

            let mut reply = DeltaTracker::default();

            while let Some(item) = frames.next().await {
                let frame = match item {
                    Ok(frame) => frame,
                    Err(e) => {
                        drop(frames);
                        drop(pending);
                        tracing::error!(
                            session_id = %session_id,
                            delivered_chars = reply.char_len(),
                            error = %e,
                            "Chat stream failed"
                        );
                        let err = if reply.is_empty() {
                            ChatError::RemoteCall(e)
                        } else {
                            ChatError::StreamInterrupted {
                                delivered_chars: reply.char_len(),
                                source: e,
                            }
                        };
                        yield Err(err);
                        return;
                    }
                };

                if let Some(reasoning) = frame.reasoning.filter(|r| !r.is_empty()) {
                    yield Ok(StreamEvent::thinking(reasoning));
                }

                if let Some(delta) = frame
                    .cumulative_content
                    .as_deref()
                    .and_then(|text| reply.advance(text))
                {
                    yield Ok(StreamEvent::content(delta));
                }
            }
            drop(frames);

            let text = reply.into_text();
            if text.is_empty() {
                // The user turn stays in history without a reply.
                pending.keep();
                tracing::warn!(session_id = %session_id, "Chat stream finished without content");
            } else {
                let reply_length = text.len();
                pending.commit(text);
                tracing::info!(
                    session_id = %session_id,
                    history_len = session.message_count(),
                    reply_length = reply_length,
                    "Chat stream completed"
                );
            }
        }
    }

    /// Delete a session's history. No-op if the session does not exist.
    pub fn clear(&self, session_id: &str) -> bool {
        self.sessions.clear(session_id)
    }

    /// History of a session; empty if it does not exist.
    #[must_use]
    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.sessions.history(session_id)
    }

    /// Display projection of a session's history.
    #[must_use]
    pub fn project(&self, session_id: &str) -> Vec<MessageView> {
        self.sessions.project(session_id)
    }

    /// Listing entries for all non-empty sessions.
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions.summaries()
    }
}

/// A user message appended ahead of a remote call.
///
/// Unless the turn is committed or explicitly kept, dropping the guard
/// removes the user message again. This covers errors, early returns and
/// cancellation alike.
struct PendingTurn<'a> {
    session: &'a Session,
    armed: bool,
}

impl<'a> PendingTurn<'a> {
    fn begin(session: &'a Session, message: &str) -> Self {
        session.push(Message::user(message));
        Self {
            session,
            armed: true,
        }
    }

    /// Record the assistant reply and keep the user message.
    fn commit(mut self, reply: String) {
        self.armed = false;
        self.session.push(Message::assistant(reply));
    }

    /// Keep the user message without a reply.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if self
            .session
            .remove_last_if_role(MessageRole::User)
            .is_some()
        {
            tracing::debug!(session_id = %self.session.id(), "Rolled back user message");
        }
    }
}

/// Running reply text of a stream, used to turn cumulative frames into deltas.
///
/// Lengths are counted in characters so a delta never splits a code point.
#[derive(Debug, Default)]
struct DeltaTracker {
    text: String,
    chars: usize,
}

impl DeltaTracker {
    /// Returns the suffix of `cumulative` beyond what was already seen, if
    /// `cumulative` is strictly longer.
    fn advance(&mut self, cumulative: &str) -> Option<String> {
        let (offset, _) = cumulative.char_indices().nth(self.chars)?;
        let delta = cumulative[offset..].to_string();
        self.chars += delta.chars().count();
        self.text = cumulative.to_string();
        Some(delta)
    }

    fn char_len(&self) -> usize {
        self.chars
    }

    fn is_empty(&self) -> bool {
        self.chars == 0
    }

    fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::llm::{FrameStream, StreamFrame};
    use crate::normalized::StreamEventKind;

    type ScriptedStream = Result<Vec<Result<StreamFrame, LlmError>>, LlmError>;

    /// Client that replays queued replies and records the history it was sent.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        streams: Mutex<VecDeque<ScriptedStream>>,
        hang_after_frames: bool,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn reply(self, text: &str) -> Self {
            self.replies.lock().unwrap().push_back(Ok(text.to_string()));
            self
        }

        fn fail(self) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(Err(LlmError::Provider("unavailable".to_string())));
            self
        }

        fn frames(self, frames: Vec<Result<StreamFrame, LlmError>>) -> Self {
            self.streams.lock().unwrap().push_back(Ok(frames));
            self
        }

        fn fail_to_open(self) -> Self {
            self.streams
                .lock()
                .unwrap()
                .push_back(Err(LlmError::Provider("unavailable".to_string())));
            self
        }

        fn seen(&self) -> Vec<Vec<Message>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            tokio::task::yield_now().await;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Provider("no scripted reply".to_string())))
        }

        async fn stream(&self, messages: &[Message]) -> Result<FrameStream, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            tokio::task::yield_now().await;
            let frames = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Provider("no scripted stream".to_string())))?;
            if self.hang_after_frames {
                Ok(Box::pin(stream::iter(frames).chain(stream::pending())))
            } else {
                Ok(Box::pin(stream::iter(frames)))
            }
        }
    }

    fn cumulative(text: &str) -> Result<StreamFrame, LlmError> {
        Ok(StreamFrame {
            reasoning: None,
            cumulative_content: Some(text.to_string()),
        })
    }

    fn reasoning(text: &str) -> Result<StreamFrame, LlmError> {
        Ok(StreamFrame {
            reasoning: Some(text.to_string()),
            cumulative_content: None,
        })
    }

    fn orchestrator(client: ScriptedClient) -> (ChatOrchestrator, Arc<ScriptedClient>) {
        let client = Arc::new(client);
        let orch = ChatOrchestrator::new(Arc::clone(&client) as Arc<dyn ChatClient>, SessionStore::new());
        (orch, client)
    }

    async fn collect(
        orch: &ChatOrchestrator,
        session_id: &str,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Vec<Result<StreamEvent, ChatError>> {
        orch.chat_stream(session_id, message, system_prompt.map(str::to_string))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_chat_appends_turn() {
        let (orch, client) = orchestrator(ScriptedClient::default().reply("Hi!"));

        let reply = orch.chat("s1", "hello", Some("sp")).await.unwrap();
        assert_eq!(reply, "Hi!");
        assert_eq!(
            orch.history("s1"),
            vec![
                Message::system("sp"),
                Message::user("hello"),
                Message::assistant("Hi!"),
            ]
        );
        // The remote call saw the user message in context.
        assert_eq!(
            client.seen()[0],
            vec![Message::system("sp"), Message::user("hello")]
        );
    }

    #[tokio::test]
    async fn test_chat_failure_restores_history() {
        let (orch, _) = orchestrator(ScriptedClient::default().reply("first").fail());

        orch.chat("s1", "q1", Some("sp")).await.unwrap();
        let before = orch.history("s1");

        let err = orch.chat("s1", "next question", Some("sp")).await.unwrap_err();
        assert!(err.is_remote_failure());
        assert_eq!(orch.history("s1"), before);
    }

    #[tokio::test]
    async fn test_first_turn_failure_keeps_system_prompt() {
        let (orch, _) = orchestrator(ScriptedClient::default().fail());

        assert!(orch.chat("s1", "hello", Some("sp")).await.is_err());
        assert_eq!(orch.history("s1"), vec![Message::system("sp")]);
    }

    #[tokio::test]
    async fn test_stream_deltas_and_history() {
        let (orch, _) = orchestrator(
            ScriptedClient::default().frames(vec![cumulative("Hi"), cumulative("Hi there")]),
        );

        let events: Vec<_> = collect(&orch, "s1", "hello", Some("sp"))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(
            events,
            vec![StreamEvent::content("Hi"), StreamEvent::content(" there")]
        );
        assert_eq!(
            orch.history("s1"),
            vec![
                Message::system("sp"),
                Message::user("hello"),
                Message::assistant("Hi there"),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_ignores_non_growing_frames() {
        let (orch, _) = orchestrator(ScriptedClient::default().frames(vec![
            cumulative("abc"),
            cumulative("abc"),
            cumulative("ab"),
            cumulative("abcdef"),
        ]));

        let deltas: Vec<String> = collect(&orch, "s1", "q", None)
            .await
            .into_iter()
            .map(|e| e.unwrap().payload)
            .collect();

        assert_eq!(deltas, vec!["abc", "def"]);
        assert_eq!(deltas.concat(), "abcdef");
        let history = orch.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], Message::assistant("abcdef"));
    }

    #[tokio::test]
    async fn test_stream_deltas_respect_char_boundaries() {
        let (orch, _) = orchestrator(
            ScriptedClient::default().frames(vec![cumulative("héllo"), cumulative("héllo wörld")]),
        );

        let deltas: Vec<String> = collect(&orch, "s1", "q", None)
            .await
            .into_iter()
            .map(|e| e.unwrap().payload)
            .collect();

        assert_eq!(deltas, vec!["héllo", " wörld"]);
    }

    #[tokio::test]
    async fn test_stream_forwards_reasoning_verbatim() {
        let (orch, _) = orchestrator(ScriptedClient::default().frames(vec![
            reasoning("step"),
            reasoning("step"),
            Ok(StreamFrame {
                reasoning: Some(String::new()),
                cumulative_content: Some("A".to_string()),
            }),
        ]));

        let events: Vec<_> = collect(&orch, "s1", "q", None)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::thinking("step"),
                StreamEvent::thinking("step"),
                StreamEvent::content("A"),
            ]
        );
        // Reasoning never reaches history.
        assert_eq!(orch.history("s1")[1], Message::assistant("A"));
    }

    #[tokio::test]
    async fn test_stream_open_failure_rolls_back() {
        let (orch, _) = orchestrator(ScriptedClient::default().fail_to_open());

        let events = collect(&orch, "s1", "hello", Some("sp")).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ChatError::RemoteCall(_))));
        assert_eq!(orch.history("s1"), vec![Message::system("sp")]);
    }

    #[tokio::test]
    async fn test_stream_midway_failure_rolls_back() {
        let (orch, _) = orchestrator(ScriptedClient::default().frames(vec![
            cumulative("partial"),
            Err(LlmError::Provider("connection reset".to_string())),
        ]));

        let events = collect(&orch, "s1", "hello", None).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &StreamEvent::content("partial"));
        match &events[1] {
            Err(ChatError::StreamInterrupted {
                delivered_chars, ..
            }) => assert_eq!(*delivered_chars, 7),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(orch.history("s1").is_empty());
    }

    #[tokio::test]
    async fn test_stream_failure_before_content_is_remote_call() {
        let (orch, _) = orchestrator(ScriptedClient::default().frames(vec![
            reasoning("thinking"),
            Err(LlmError::Provider("boom".to_string())),
        ]));

        let events = collect(&orch, "s1", "hello", None).await;
        assert!(matches!(events.last(), Some(Err(ChatError::RemoteCall(_)))));
        assert!(orch.history("s1").is_empty());
    }

    /// An empty but successful stream keeps the user message with no reply.
    /// This may hide silent provider failures; it is preserved on purpose.
    #[tokio::test]
    async fn test_empty_stream_keeps_user_message() {
        let (orch, _) = orchestrator(ScriptedClient::default().frames(vec![]));

        let events = collect(&orch, "s1", "hello", Some("sp")).await;
        assert!(events.is_empty());
        assert_eq!(
            orch.history("s1"),
            vec![Message::system("sp"), Message::user("hello")]
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_rolls_back() {
        let client = ScriptedClient {
            hang_after_frames: true,
            ..ScriptedClient::default()
        }
        .frames(vec![cumulative("Hel")]);
        let (orch, _) = orchestrator(client);

        let mut stream = Box::pin(orch.chat_stream("s1", "hello", None));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.kind, StreamEventKind::Content);
        assert_eq!(orch.history("s1"), vec![Message::user("hello")]);

        drop(stream);
        assert!(orch.history("s1").is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let (orch, client) = orchestrator(ScriptedClient::default().frames(vec![cumulative("x")]));

        let stream = orch.chat_stream("s1", "hello", None);
        assert!(orch.sessions().get("s1").is_none());
        assert!(client.seen().is_empty());
        drop(stream);
    }

    #[tokio::test]
    async fn test_same_session_turns_are_serialized() {
        let (orch, _) = orchestrator(ScriptedClient::default().reply("a1").reply("a2"));

        let (r1, r2) = tokio::join!(orch.chat("s1", "q1", None), orch.chat("s1", "q2", None));
        r1.unwrap();
        r2.unwrap();

        let roles: Vec<MessageRole> = orch.history("s1").iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant,
            ]
        );
    }

    #[tokio::test]
    async fn test_same_session_streams_are_serialized() {
        let (orch, client) = orchestrator(
            ScriptedClient::default()
                .frames(vec![cumulative("a"), cumulative("a1")])
                .frames(vec![cumulative("a2")]),
        );

        let (first, second): (Vec<_>, Vec<_>) = tokio::join!(
            orch.chat_stream("s1", "q1", None).collect(),
            orch.chat_stream("s1", "q2", None).collect()
        );
        assert!(first.iter().all(Result::is_ok));
        assert!(second.iter().all(Result::is_ok));

        let history = orch.history("s1");
        let roles: Vec<MessageRole> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant,
            ]
        );
        assert_eq!(history[1].content, "a1");
        assert_eq!(history[3].content, "a2");
        // The second turn saw the first one complete.
        assert_eq!(client.seen()[1].len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_during_stream_keeps_history() {
        let (orch, _) = orchestrator(
            ScriptedClient::default().frames(vec![cumulative("Hel"), cumulative("Hello")]),
        );

        let mut stream = Box::pin(orch.chat_stream("s1", "hello", Some("sp".to_string())));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, StreamEvent::content("Hel"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            orch.sessions()
                .cleanup_expired_with_timeout(Duration::from_millis(10)),
            0
        );

        while let Some(item) = stream.next().await {
            item.unwrap();
        }
        assert_eq!(
            orch.history("s1"),
            vec![
                Message::system("sp"),
                Message::user("hello"),
                Message::assistant("Hello"),
            ]
        );

        // Once the turn is over the session expires normally.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            orch.sessions()
                .cleanup_expired_with_timeout(Duration::from_millis(10)),
            1
        );
    }

    #[test]
    fn test_delta_tracker() {
        let mut tracker = DeltaTracker::default();
        assert!(tracker.is_empty());
        assert_eq!(tracker.advance(""), None);
        assert_eq!(tracker.advance("ab").as_deref(), Some("ab"));
        assert_eq!(tracker.advance("a"), None);
        assert_eq!(tracker.advance("abc").as_deref(), Some("c"));
        assert_eq!(tracker.char_len(), 3);
        assert_eq!(tracker.into_text(), "abc");
    }
}
