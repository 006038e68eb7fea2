//! Conversation thread and session storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::llm::{Message, MessageRole};

/// Maximum number of characters of the first user message used as a title.
const TITLE_MAX_CHARS: usize = 50;

/// Title used for sessions that have no user message yet.
const UNTITLED: &str = "New conversation";

/// Errors raised by [`SessionStore`] operations that require an existing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Display projection of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for MessageView {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// First user message, truncated.
    pub title: String,
    /// Number of user and assistant messages.
    pub message_count: usize,
    /// Last activity, RFC 3339.
    pub last_updated: String,
}

/// A single conversation session.
///
/// Sessions maintain the full message history. Cloning a session is cheap
/// and yields another handle to the same history.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    /// Unique session identifier.
    id: String,
    /// Conversation messages.
    messages: RwLock<Vec<Message>>,
    /// Session creation time.
    created_at: DateTime<Utc>,
    /// Last activity time.
    last_activity: RwLock<DateTime<Utc>>,
    /// Serializes turns on this session.
    turn: Mutex<()>,
}

impl Session {
    /// Create a new session with the given ID.
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                messages: RwLock::new(Vec::new()),
                created_at: now,
                last_activity: RwLock::new(now),
                turn: Mutex::new(()),
            }),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Session creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Time of the last mutation.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *read(&self.inner.last_activity)
    }

    /// Wait for exclusive use of this session for one turn.
    ///
    /// The guard must be held across the whole append, remote call, append
    /// sequence so two requests for the same session cannot interleave.
    pub async fn lock_turn(&self) -> MutexGuard<'_, ()> {
        self.inner.turn.lock().await
    }

    /// Whether a turn currently holds this session's turn lock.
    #[must_use]
    pub fn is_turn_active(&self) -> bool {
        self.inner.turn.try_lock().is_err()
    }

    /// Append a message to the conversation.
    pub fn push(&self, message: Message) {
        write(&self.inner.messages).push(message);
        self.touch();
    }

    /// Remove the final message if it has the given role.
    ///
    /// System messages are never removed.
    pub fn remove_last_if_role(&self, role: MessageRole) -> Option<Message> {
        if role == MessageRole::System {
            return None;
        }
        let mut guard = write(&self.inner.messages);
        let removed = match guard.last() {
            Some(last) if last.role == role => guard.pop(),
            _ => None,
        };
        drop(guard);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Get all messages in the conversation.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        read(&self.inner.messages).clone()
    }

    /// Get the number of messages in the conversation.
    #[must_use]
    pub fn message_count(&self) -> usize {
        read(&self.inner.messages).len()
    }

    /// Build the listing entry for this session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let messages = read(&self.inner.messages);
        let title = messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map_or_else(
                || UNTITLED.to_string(),
                |m| m.content.chars().take(TITLE_MAX_CHARS).collect(),
            );
        let message_count = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .count();
        drop(messages);

        SessionSummary {
            session_id: self.inner.id.clone(),
            title,
            message_count,
            last_updated: self.last_activity().to_rfc3339(),
        }
    }

    /// Check if the session has been idle longer than `timeout`.
    #[must_use]
    pub fn is_expired_with_timeout(&self, timeout: Duration) -> bool {
        let last = self.last_activity();
        match (Utc::now() - last).to_std() {
            Ok(idle) => idle > timeout,
            // Negative duration means clock skew.
            Err(_) => false,
        }
    }

    /// Update the last activity timestamp.
    fn touch(&self) {
        *write(&self.inner.last_activity) = Utc::now();
    }
}

/// Thread-safe store for sessions.
///
/// The store is an owned object: the server creates one at startup and it
/// lives as long as the application state. Handles are cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

#[derive(Debug)]
struct SessionStoreInner {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create a new, empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        read(&self.inner.sessions).get(id).cloned()
    }

    /// Get a session by ID, creating it if it doesn't exist.
    ///
    /// A non-empty `system_prompt` becomes the first message of a newly
    /// created session. It is ignored for sessions that already exist.
    pub fn get_or_create(&self, id: &str, system_prompt: Option<&str>) -> Session {
        if let Some(session) = self.get(id) {
            return session;
        }

        let mut guard = write(&self.inner.sessions);
        // Another request may have created it between the two locks.
        if let Some(session) = guard.get(id) {
            return session.clone();
        }

        let session = Session::new(id.to_string());
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            session.push(Message::system(prompt));
        }
        guard.insert(id.to_string(), session.clone());
        drop(guard);

        tracing::debug!(
            session_id = %id,
            has_system_prompt = session.message_count() > 0,
            "Created session"
        );
        session
    }

    /// Append a message to an existing session.
    pub fn append(&self, id: &str, message: Message) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.push(message);
        Ok(())
    }

    /// Remove the final message of a session if it has the given role.
    ///
    /// No-op for absent sessions, other roles, or `MessageRole::System`.
    pub fn remove_last_if_role(&self, id: &str, role: MessageRole) -> Option<Message> {
        self.get(id)?.remove_last_if_role(role)
    }

    /// Delete a session and its history. Returns whether it existed.
    pub fn clear(&self, id: &str) -> bool {
        let removed = write(&self.inner.sessions).remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Cleared session");
        }
        removed
    }

    /// Snapshot of every session and its messages, oldest session first.
    #[must_use]
    pub fn list(&self) -> Vec<(String, Vec<Message>)> {
        self.sorted_sessions()
            .into_iter()
            .map(|s| (s.id().to_string(), s.messages()))
            .collect()
    }

    /// History of a session; empty if the session does not exist.
    #[must_use]
    pub fn history(&self, id: &str) -> Vec<Message> {
        self.get(id).map(|s| s.messages()).unwrap_or_default()
    }

    /// Display projection of a session's history. All roles are included.
    #[must_use]
    pub fn project(&self, id: &str) -> Vec<MessageView> {
        self.history(id).iter().map(MessageView::from).collect()
    }

    /// Listing entries for every non-empty session, oldest first.
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sorted_sessions()
            .into_iter()
            .filter(|s| s.message_count() > 0)
            .map(|s| s.summary())
            .collect()
    }

    /// Get the number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.inner.sessions).len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove sessions that have been inactive longer than the timeout.
    ///
    /// Sessions with a turn in flight are kept regardless of idle time.
    /// Returns the number of sessions removed.
    pub fn cleanup_expired_with_timeout(&self, timeout: Duration) -> usize {
        let mut guard = write(&self.inner.sessions);
        let before = guard.len();
        guard.retain(|_, session| {
            session.is_turn_active() || !session.is_expired_with_timeout(timeout)
        });
        before - guard.len()
    }

    fn sorted_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = read(&self.inner.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
