//! HTTP API for the kiln web client.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/files` - Project tree
//! - `GET /api/files/*path` - Read one file
//! - `PUT /api/files/*path` - Write one file and mirror it into the sandbox
//! - `POST /api/generate` - SSE stream of `partial` artifacts, then `complete` or `error`
//! - `GET /api/preview` - Current readiness
//! - `GET /api/preview/events` - SSE readiness stream, latest value first
//! - `GET /api/sandbox` - Lifecycle status
//! - `POST /api/sandbox/restart` - Discard the sandbox and boot a new one

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use kiln_core::{
    ApplyReport, SandboxLifecycleManager, StoreError, Workspace, WorkspaceError,
};
use kiln_gen::{GeneratedArtifact, GenerationClient, GenerationEvent, GenerationRequest};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub workspace: Workspace,
    pub generator: GenerationClient,
}

impl AppState {
    pub fn new(workspace: Workspace, generator: GenerationClient) -> Self {
        Self {
            workspace,
            generator,
        }
    }

    fn manager(&self) -> &SandboxLifecycleManager {
        self.workspace.manager()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/files", get(tree_handler))
        .route(
            "/api/files/*path",
            get(read_file_handler).put(write_file_handler),
        )
        .route("/api/generate", post(generate_handler))
        .route("/api/preview", get(preview_handler))
        .route("/api/preview/events", get(preview_events_handler))
        .route("/api/sandbox", get(sandbox_status_handler))
        .route("/api/sandbox/restart", post(sandbox_restart_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// Runs until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Boot the sandbox in the background if it is not already booting.
///
/// Failures land in the lifecycle status and the readiness channel.
pub fn ensure_booting(manager: &SandboxLifecycleManager) {
    let manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.acquire().await {
            tracing::warn!(error = %e, "Sandbox is not available");
        }
    });
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error, rendered as `{"error": message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Workspace(WorkspaceError::Store(StoreError::Conflict { .. })) => {
                StatusCode::CONFLICT
            }
            Self::Workspace(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Files
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "kiln-server"
    }))
}

async fn tree_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.workspace.tree().await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileBody {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub content: String,
}

async fn read_file_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<FileBody>, ApiError> {
    let content = state
        .workspace
        .read_file(&path)
        .await
        .ok_or_else(|| ApiError::NotFound(path.clone()))?;
    Ok(Json(FileBody { path, content }))
}

async fn write_file_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.workspace.write_file(&path, &body.content).await?;
    Ok(Json(report))
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// Payload of the `complete` event.
#[derive(Debug, Serialize)]
struct CompletePayload<'a> {
    artifact: &'a GeneratedArtifact,
    parse_failed: bool,
    apply: &'a ApplyReport,
}

/// Payload of the `error` event.
#[derive(Debug, Serialize)]
struct ErrorPayload {
    message: String,
    retryable: bool,
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt is required".into()));
    }

    let mut request = GenerationRequest::new(body.prompt);
    if let Some(context) = body.context {
        request = request.with_context(context);
    }
    tracing::info!(prompt_len = request.prompt.len(), "Generation requested");

    // Dropping the response stream (client gone) cancels the backend request.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let mut generation = Box::pin(state.generator.generate(request, cancel));
    let workspace = state.workspace.clone();

    let events = async_stream::stream! {
        let _guard = guard;
        while let Some(item) = generation.next().await {
            match item {
                Ok(GenerationEvent::Partial(artifact)) => {
                    yield Ok(json_event("partial", &artifact));
                }
                Ok(GenerationEvent::Complete(completion)) => {
                    // Runs to completion even if the client disconnects mid-apply.
                    let apply = {
                        let workspace = workspace.clone();
                        let artifact = completion.artifact.clone();
                        tokio::spawn(async move { workspace.apply_artifact(&artifact).await })
                    };
                    match apply.await {
                        Ok(Ok(report)) => {
                            let payload = CompletePayload {
                                artifact: &completion.artifact,
                                parse_failed: completion.parse_failed,
                                apply: &report,
                            };
                            yield Ok(json_event("complete", &payload));
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Failed to apply artifact");
                            yield Ok(error_event(e.to_string(), false));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Apply task failed");
                            yield Ok(error_event(format!("apply task failed: {e}"), false));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, retryable = e.is_retryable(), "Generation failed");
                    yield Ok(error_event(e.to_string(), e.is_retryable()));
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn json_event<T: Serialize>(name: &str, value: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| error_event(e.to_string(), false))
}

fn error_event(message: String, retryable: bool) -> Event {
    let payload = ErrorPayload { message, retryable };
    let data = serde_json::to_string(&payload).unwrap_or_default();
    Event::default().event("error").data(data)
}

// ============================================================================
// Preview and sandbox
// ============================================================================

async fn preview_handler(State(state): State<AppState>) -> impl IntoResponse {
    ensure_booting(state.manager());
    Json(state.manager().broadcaster().current())
}

async fn preview_events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    ensure_booting(state.manager());
    let events = state
        .manager()
        .subscribe()
        .into_stream()
        .map(|readiness| Ok(json_event("readiness", &readiness)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn sandbox_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager().status().await)
}

async fn sandbox_restart_handler(State(state): State<AppState>) -> impl IntoResponse {
    let generation = state.manager().restart().await;
    ensure_booting(state.manager());
    Json(serde_json::json!({ "generation": generation }))
}
