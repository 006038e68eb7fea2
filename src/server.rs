use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderName, StatusCode, header},
    middleware::Next,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::config::AppConfig;
use crate::llm::{ChatClient, ChatCompletionsClient, ChatOrchestrator, MessageRole};
use crate::normalized::StreamEvent;
use crate::session::{MessageView, SessionSummary};

/// Session id that clients send when they have none; it is never stored.
pub const DEFAULT_SESSION_ID: &str = "default";

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let settings = config.llm_settings();
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        has_api_key = settings.api_key.is_some(),
        "LLM configuration loaded"
    );

    let client: Arc<dyn ChatClient> = Arc::new(ChatCompletionsClient::new(settings)?);
    let state = AppState::new(Arc::clone(&config), client);

    if let Some(idle_timeout) = config.session_idle_timeout() {
        spawn_session_sweeper(
            state.clone(),
            idle_timeout,
            Duration::from_secs(config.sessions.sweep_interval_secs.max(1)),
        );
    }

    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        app = %config.app.name,
        "Server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let app = Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/clear", post(api_clear))
        .route("/api/conversations", get(api_list_conversations))
        .route("/api/conversation/{session_id}", get(api_get_conversation))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let app = match state.config.request_timeout() {
        Some(timeout) => app.layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => ApiError::new(StatusCode::REQUEST_TIMEOUT, "Request timed out")
                        .into_response(),
                }
            },
        )),
        None => app,
    };

    app.with_state(state)
}

fn spawn_session_sweeper(state: AppState, idle_timeout: Duration, every: Duration) {
    info!(
        idle_timeout_secs = idle_timeout.as_secs(),
        sweep_interval_secs = every.as_secs(),
        "Session expiry enabled"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = state.sessions().cleanup_expired_with_timeout(idle_timeout);
            if removed > 0 {
                info!(
                    removed = removed,
                    remaining = state.sessions().len(),
                    "Expired idle sessions"
                );
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error response rendered as `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// User message content.
    message: String,
    /// Optional session ID; absent or "default" starts a new session.
    #[serde(default)]
    session_id: Option<String>,
    /// Stream the reply as server-sent events.
    #[serde(default)]
    stream: bool,
}

/// Response from the non-streaming chat API.
#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    session_id: String,
}

/// POST /api/chat - Run one chat turn, whole or streamed.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session_id(req.session_id);

    info!(
        session_id = %session_id,
        message_length = req.message.len(),
        stream = req.stream,
        "Received chat request"
    );

    let system_prompt = state.config.chat.system_prompt.clone();

    if req.stream {
        return Ok(stream_chat(
            Arc::clone(&state.orchestrator),
            session_id,
            req.message,
            system_prompt,
        ));
    }

    let response = state
        .orchestrator
        .chat(&session_id, &req.message, Some(&system_prompt))
        .await
        .map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "Chat request failed");
            ApiError::internal(format!("Error processing request: {e}"))
        })?;

    Ok(Json(ChatResponse {
        response,
        session_id,
    })
    .into_response())
}

/// Relay an orchestrator stream as SSE, terminated by `done` or `error`.
fn stream_chat(
    orchestrator: Arc<ChatOrchestrator>,
    session_id: String,
    message: String,
    system_prompt: String,
) -> Response {
    let events = orchestrator.chat_stream(session_id.clone(), message, Some(system_prompt));

    let sse_stream = async_stream::stream! {
        futures::pin_mut!(events);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => yield Ok::<Event, Infallible>(sse_event(&event, &session_id)),
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Streaming response failed");
                    yield Ok(sse_event(&StreamEvent::error(e.to_string()), &session_id));
                    return;
                }
            }
        }
        yield Ok(sse_event(&StreamEvent::done(), &session_id));
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)),
    )
        .into_response()
}

fn sse_event(event: &StreamEvent, session_id: &str) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .data(event.to_json(session_id).to_string())
}

/// Use the caller's session id unless it is missing or the shared default.
fn resolve_session_id(requested: Option<String>) -> String {
    match requested {
        Some(id) if !id.is_empty() && id != DEFAULT_SESSION_ID => id,
        _ => Uuid::new_v4().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ClearRequest {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    message: &'static str,
    session_id: String,
}

/// POST /api/clear - Drop a session's history.
async fn api_clear(
    State(state): State<AppState>,
    Json(req): Json<ClearRequest>,
) -> Json<ClearResponse> {
    let session_id = req
        .session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());

    let existed = state.orchestrator.clear(&session_id);
    info!(session_id = %session_id, existed = existed, "Cleared conversation");

    Json(ClearResponse {
        message: "Conversation history cleared",
        session_id,
    })
}

#[derive(Debug, Serialize)]
struct ConversationsResponse {
    conversations: Vec<SessionSummary>,
}

/// GET /api/conversations - List non-empty conversations.
async fn api_list_conversations(State(state): State<AppState>) -> Json<ConversationsResponse> {
    Json(ConversationsResponse {
        conversations: state.orchestrator.summaries(),
    })
}

#[derive(Debug, Serialize)]
struct ConversationResponse {
    session_id: String,
    messages: Vec<MessageView>,
}

/// GET /api/conversation/{session_id} - Conversation history without the system prompt.
async fn api_get_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ConversationResponse> {
    let messages = state
        .orchestrator
        .project(&session_id)
        .into_iter()
        .filter(|m| m.role != MessageRole::System)
        .collect();

    Json(ConversationResponse {
        session_id,
        messages,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    app: String,
    version: &'static str,
}

/// GET /health - Liveness probe.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: state.config.app.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
