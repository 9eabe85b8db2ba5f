//! HTTP surface for the chat widget and knowledge-base administration.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Send a message, get the full reply |
//! | `GET`  | `/chat/stream` | Send a message, get an SSE event stream |
//! | `GET`  | `/widget-config` | Widget rendering settings |
//! | `POST` | `/escalate` | Submit escalation contact details |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/knowledge` | List knowledge files (admin) |
//! | `POST` | `/knowledge?name=` | Upload a document; body is the raw bytes (admin) |
//! | `POST` | `/knowledge/{id}/reprocess` | Re-chunk and re-embed a file (admin) |
//! | `DELETE` | `/knowledge/{id}` | Delete a file (admin) |
//!
//! Admin routes exist only when `[server].admin_token` is set, and require
//! `Authorization: Bearer <token>`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "too many messages, ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `too_large` (413), `unprocessable` (422), `rate_limited` (429),
//! `internal` (500), `not_configured` (503).
//!
//! A disabled or keyless agent is not an HTTP failure for the widget:
//! `POST /chat` answers `200` with `{ "error": "...", "status": "error" }`.
//!
//! # Streaming
//!
//! `/chat/stream` emits `token`, `tool_call`, `tool_result`, `escalation`,
//! and `error` events and always ends with `done`. Requests rejected before
//! the turn starts still get a stream: one `error` event, then `done`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::App;
use crate::chat::{ChatEvent, ChatRequest, ReplyStatus};
use crate::config::Config;
use crate::error::{ChatError, IngestError};
use crate::extract::MIME_TEXT;
use crate::models::KnowledgeFile;
use crate::widget::WidgetConfigView;

/// Upload allowance on top of `max_file_bytes`, so oversized files reach
/// the ingestor and get a proper `too_large` error.
const UPLOAD_SLACK_BYTES: usize = 64 * 1024;

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = App::build(config).await?;
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("listening on http://{}", listener.local_addr()?);
    serve(app, listener).await
}

/// Serve on an already-bound listener.
pub async fn serve(app: App, listener: TcpListener) -> anyhow::Result<()> {
    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn router(app: App) -> Router {
    let state = AppState { app: Arc::new(app) };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/chat", post(handle_send))
        .route("/chat/stream", get(handle_stream))
        .route("/widget-config", get(handle_widget_config))
        .route("/escalate", post(handle_escalate))
        .route("/health", get(handle_health));

    if state.app.config.server.admin_token.is_some() {
        let upload_limit = state.app.config.storage.max_file_bytes as usize + UPLOAD_SLACK_BYTES;
        let admin = Router::new()
            .route("/knowledge", get(handle_list_files).post(handle_upload))
            .route("/knowledge/{id}", axum::routing::delete(handle_delete_file))
            .route("/knowledge/{id}/reprocess", post(handle_reprocess))
            .layer(DefaultBodyLimit::max(upload_limit))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.merge(admin);
    }

    router.layer(cors).with_state(state)
}

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!("request failed: {err:#}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal server error",
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let message = err.to_string();
        match err {
            ChatError::NotConfigured => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "not_configured", message)
            }
            ChatError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, "bad_request", message),
            ChatError::RateLimited => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
            }
            ChatError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            ChatError::Storage(e) => Self::internal(e),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::TooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", message)
            }
            IngestError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            IngestError::Extraction(_) | IngestError::Empty(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", message)
            }
            IngestError::Storage(e) => Self::internal(e),
        }
    }
}

// ============ Auth ============

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state.app.config.server.admin_token.as_deref().unwrap_or("");
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if expected.is_empty() || presented != expected {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin token",
        ));
    }
    Ok(next.run(request).await)
}

// ============ Chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    page_url: Option<String>,
}

impl ChatBody {
    fn into_request(self, addr: SocketAddr) -> ChatRequest {
        ChatRequest::new(self.session_id, self.message)
            .with_page_url(self.page_url)
            .with_ip(Some(addr.ip().to_string()))
    }
}

async fn handle_send(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    match state.app.chat.send(body.into_request(addr)).await {
        Ok(reply) => Ok(Json(reply).into_response()),
        Err(err @ ChatError::NotConfigured) => Ok(Json(json!({
            "error": err.to_string(),
            "status": ReplyStatus::Error,
        }))
        .into_response()),
        Err(err) => Err(err.into()),
    }
}

async fn handle_stream(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ChatBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = params.session_id.clone();
    let rx = match state.app.chat.stream(params.into_request(addr)).await {
        Ok(rx) => rx,
        Err(err) => {
            if let ChatError::Storage(e) = &err {
                error!("stream admission failed: {e:#}");
            }
            rejected_stream(session_id, err)
        }
    };

    let events = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .event(event.name())
            .data(event.data().to_string()))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Two-event stream for a request refused before the turn started.
fn rejected_stream(session_id: String, err: ChatError) -> mpsc::Receiver<ChatEvent> {
    let message = match err {
        ChatError::Storage(_) => "internal server error".to_string(),
        other => other.to_string(),
    };
    let (tx, rx) = mpsc::channel(2);
    let _ = tx.try_send(ChatEvent::Error { message });
    let _ = tx.try_send(ChatEvent::Done {
        session_id,
        message_id: None,
        status: ReplyStatus::Error,
    });
    rx
}

async fn handle_widget_config(State(state): State<AppState>) -> Json<WidgetConfigView> {
    Json(state.app.chat.widget_config())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscalateBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    contact: Value,
}

#[derive(Serialize)]
struct EscalateResponse {
    status: &'static str,
    confirmation: String,
}

async fn handle_escalate(
    State(state): State<AppState>,
    Json(body): Json<EscalateBody>,
) -> Result<Json<EscalateResponse>, AppError> {
    let confirmation = state
        .app
        .chat
        .escalate_contact(&body.session_id, body.contact)
        .await?;
    Ok(Json(EscalateResponse {
        status: "ok",
        confirmation,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Knowledge base ============

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<KnowledgeFile>,
}

async fn handle_list_files(
    State(state): State<AppState>,
) -> Result<Json<FileListResponse>, AppError> {
    let files = state
        .app
        .store
        .list_files(None)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(FileListResponse { files }))
}

#[derive(Deserialize)]
struct UploadParams {
    name: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<KnowledgeFile>), AppError> {
    let name = params.name.trim();
    if name.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "name must not be empty",
        ));
    }
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(MIME_TEXT)
        .to_string();

    let file = state.app.ingestor.ingest(&body, &mime_type, name).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

async fn handle_reprocess(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeFile>, AppError> {
    Ok(Json(state.app.ingestor.reprocess(&id).await?))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.app.ingestor.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
