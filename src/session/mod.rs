//! Session and conversation thread management.
//!
//! This module provides in-memory session storage for managing conversation
//! state across multiple requests. Sessions are identified by an opaque
//! string key and contain the full message history. Nothing is persisted.
//!
//! # Architecture
//!
//! - [`Session`]: A single conversation and its turn lock
//! - [`SessionStore`]: Thread-safe store for all active sessions
//!
//! # Example
//!
//! ```rust
//! use session_chat::llm::Message;
//! use session_chat::session::SessionStore;
//!
//! let store = SessionStore::new();
//! store.get_or_create("s1", Some("You are terse."));
//! store.append("s1", Message::user("Hello!")).unwrap();
//!
//! assert_eq!(store.history("s1").len(), 2);
//! ```

mod thread;

pub use thread::{MessageView, Session, SessionError, SessionStore, SessionSummary};
