//! Session Chat
//!
//! A conversational chat backend that keeps per-session history in memory,
//! forwards each turn to an OpenAI-compatible completion endpoint, and
//! returns the reply either whole or as a stream of server-sent events.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server with SSE streaming
//! - **LLM Orchestration**: Session-aware turns with rollback on failure
//! - **Sessions**: In-memory, per-session serialized history
//!
//! # Modules
//!
//! - [`config`]: Layered configuration (defaults, file, env, CLI)
//! - [`llm`]: Remote client trait, OpenAI-compatible client, orchestrator
//! - [`normalized`]: Stream event model
//! - [`server`]: HTTP routes and server startup
//! - [`session`]: Conversation and session management
//! - [`telemetry`]: Structured logging setup

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod llm;
pub mod normalized;
pub mod server;
pub mod session;
pub mod telemetry;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::{ChatClient, ChatOrchestrator};
use crate::session::SessionStore;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Chat orchestrator; owns the session store.
    pub orchestrator: Arc<ChatOrchestrator>,
    /// Global configuration.
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Build state around `client` with a fresh, empty session store.
    pub fn new(config: Arc<AppConfig>, client: Arc<dyn ChatClient>) -> Self {
        Self {
            orchestrator: Arc::new(ChatOrchestrator::new(client, SessionStore::new())),
            config,
        }
    }

    /// Session store owned by the orchestrator.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        self.orchestrator.sessions()
    }
}
