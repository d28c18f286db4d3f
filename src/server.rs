//! HTTP surface for the continuity engine.
//!
//! A thin JSON/multipart layer over [`Engine`]: every handler delegates to
//! an engine operation and maps [`EngineError`] onto the wire contract.
//! Normalized renditions are served straight from the media root as static
//! files.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/api/threads` | Create a thread |
//! | `GET`    | `/api/threads` | List threads, newest first |
//! | `GET`    | `/api/threads/{id}` | Thread detail with posts and assets |
//! | `DELETE` | `/api/threads/{id}` | Delete a thread and everything it owns |
//! | `POST`   | `/api/threads/{id}/posts` | Multipart upload: one post plus images |
//! | `POST`   | `/api/threads/{id}/promote` | Mark a thread curated (idempotent) |
//! | `GET`    | `/api/threads/{id}/continuity` | Cross-thread asset chains |
//! | `GET`    | `<media.url_prefix>/...` | Stored renditions |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "thread not found: 0198..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_format` (400),
//! `corrupt_image` (400), `not_found` (404), `store_unavailable` (503),
//! `index_inconsistent` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based clients
//! can upload and query directly.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::models::{Asset, ContinuityReport, NewPost, NewThread, Post, Thread, ThreadDetail};
use crate::phash;

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Engine::open(config).await?;
    println!(
        "Rebuilt continuity index: {} assets",
        engine.indexed_assets().await
    );

    let bind_addr = config.server.bind.clone();
    let app = build_router(Arc::new(engine), config);

    println!("Continuity server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the full router for an already-open engine. Split out from
/// [`run_server`] so integration tests can drive it without binding a
/// socket.
pub fn build_router(engine: Arc<Engine>, config: &Config) -> Router {
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/threads",
            post(handle_create_thread).get(handle_list_threads),
        )
        .route(
            "/api/threads/{id}",
            get(handle_get_thread).delete(handle_delete_thread),
        )
        .route("/api/threads/{id}/posts", post(handle_create_post))
        .route("/api/threads/{id}/promote", post(handle_promote))
        .route("/api/threads/{id}/continuity", get(handle_continuity))
        .nest_service(
            &config.media.url_prefix,
            ServeDir::new(&config.media.root),
        )
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable
/// message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        let (status, code) = match e {
            EngineError::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "unsupported_format"),
            EngineError::CorruptImage(_) => (StatusCode::BAD_REQUEST, "corrupt_image"),
            EngineError::ThreadNotFound(_) | EngineError::PostNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            EngineError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            EngineError::IndexInconsistency(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "index_inconsistent")
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message,
        }
    }
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check used by load balancers and the CLI's `serve` smoke test.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/threads ============

/// Creates a thread from a JSON body. Title is required and must be
/// non-blank; location, year, and notes are optional.
async fn handle_create_thread(
    State(state): State<AppState>,
    Json(new): Json<NewThread>,
) -> Result<Json<Thread>, AppError> {
    if new.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    Ok(Json(state.engine.create_thread(&new).await?))
}

// ============ GET /api/threads ============

/// JSON response body for `GET /api/threads`.
#[derive(Serialize)]
struct ThreadListResponse {
    threads: Vec<Thread>,
}

async fn handle_list_threads(
    State(state): State<AppState>,
) -> Result<Json<ThreadListResponse>, AppError> {
    Ok(Json(ThreadListResponse {
        threads: state.engine.list_threads().await?,
    }))
}

// ============ GET /api/threads/{id} ============

async fn handle_get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadDetail>, AppError> {
    Ok(Json(state.engine.get_thread(&id).await?))
}

// ============ POST /api/threads/{id}/posts ============

/// JSON response body for a successful upload.
#[derive(Serialize)]
struct CreatedPost {
    post: Post,
    assets: Vec<Asset>,
}

/// Accepts a multipart form with an `author` part, an optional `text`
/// part, and any number of `image` file parts. The whole upload is atomic:
/// one bad image fails the request and nothing is stored.
async fn handle_create_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<CreatedPost>, AppError> {
    let mut new = NewPost::default();
    let mut saw_author = false;
    let mut images: Vec<Vec<u8>> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "author" => {
                new.author = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("unreadable author field: {}", e)))?;
                saw_author = true;
            }
            "text" => {
                new.body = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("unreadable text field: {}", e)))?;
            }
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("unreadable image field: {}", e)))?;
                images.push(bytes.to_vec());
            }
            // Unknown parts are ignored so simple HTML forms keep working.
            _ => {}
        }
    }

    if !saw_author || new.author.trim().is_empty() {
        return Err(bad_request("author must not be empty"));
    }

    let (post, assets) = state.engine.add_post(&id, &new, &images).await?;
    Ok(Json(CreatedPost { post, assets }))
}

// ============ POST /api/threads/{id}/promote ============

/// JSON response body for `POST /api/threads/{id}/promote`.
#[derive(Serialize)]
struct PromoteResponse {
    thread_id: String,
    promoted: bool,
}

async fn handle_promote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PromoteResponse>, AppError> {
    state.engine.promote(&id).await?;
    Ok(Json(PromoteResponse {
        thread_id: id,
        promoted: true,
    }))
}

// ============ DELETE /api/threads/{id} ============

/// JSON response body for `DELETE /api/threads/{id}`.
#[derive(Serialize)]
struct DeleteResponse {
    thread_id: String,
    assets_removed: usize,
}

async fn handle_delete_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let assets_removed = state.engine.delete_thread(&id).await?;
    Ok(Json(DeleteResponse {
        thread_id: id,
        assets_removed,
    }))
}

// ============ GET /api/threads/{id}/continuity ============

/// Query parameters for `GET /api/threads/{id}/continuity`.
#[derive(Deserialize)]
struct ContinuityParams {
    max_distance: Option<u32>,
}

async fn handle_continuity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ContinuityParams>,
) -> Result<Json<ContinuityReport>, AppError> {
    if let Some(d) = params.max_distance {
        if d > phash::HASH_BITS {
            return Err(bad_request(format!(
                "max_distance must be <= {}",
                phash::HASH_BITS
            )));
        }
    }
    Ok(Json(
        state.engine.continuity(&id, params.max_distance).await?,
    ))
}
