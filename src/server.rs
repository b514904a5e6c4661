//! Orchestrator HTTP server.
//!
//! One long-lived process owns the shared encoder and the process manager.
//! Workers reach the encoder through `/api/encoder/*`; UIs and scripts drive
//! sessions through `/api/sessions/*`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/encoder/status` | Encoder state snapshot |
//! | `POST` | `/api/encoder/load` | Load the configured model (idempotent) |
//! | `POST` | `/api/encoder/release` | Drop the resident model |
//! | `POST` | `/api/encoder/encode/video` | `{video_batch}` → one vector per segment |
//! | `POST` | `/api/encoder/encode/query` | `{query}` → one vector |
//! | `POST` | `/api/sessions/{id}/index` | Start an indexing worker |
//! | `POST` | `/api/sessions/{id}/query` | Start a query worker |
//! | `GET`  | `/api/sessions/{id}/status` | Status document, or one namespace with `?kind=` |
//! | `GET`  | `/api/sessions/{id}/videos` | Indexed videos |
//! | `GET`  | `/api/sessions/{id}/progress` | Per-stage progress from the artifacts |
//! | `POST` | `/api/sessions/{id}/terminate` | Terminate the session's workers |
//! | `DELETE` | `/api/sessions/{id}` | Terminate and remove the session |
//! | `GET`  | `/api/system/status` | Encoder, active sessions, worker count |
//! | `GET`  | `/api/system/processes` | Tracked worker processes |
//!
//! # Error Contract
//!
//! Every response carries `success`. Failures look like:
//!
//! ```json
//! { "success": false, "error": "video batch is empty", "code": "invalid_request" }
//! ```
//!
//! Invalid input is 400, an unknown session 404, an unloaded encoder or a
//! job already running 409, anything else 500.
//!
//! Blocking work (model loads, encodes, spawning and terminating workers,
//! status file I/O) runs on `spawn_blocking` so one slow session never
//! stalls the others.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::artifacts::ArtifactStore;
use crate::client::{EncodeQueryRequest, EncodeResponse, EncodeVideoRequest, StatusResponse};
use crate::config::Config;
use crate::encoder::{create_backend, matrix_to_base64, SharedEncoder};
use crate::error::Error;
use crate::process::{sweep_orphans, JobKind, ProcessManager, SelfExecLauncher};
use crate::session::validate_session_id;
use crate::status::StatusStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub encoder: Arc<SharedEncoder>,
    pub processes: Arc<ProcessManager>,
    pub store: Arc<StatusStore>,
}

impl AppState {
    pub fn new(config: Arc<Config>, encoder: Arc<SharedEncoder>, processes: Arc<ProcessManager>) -> Self {
        let store = processes.store().clone();
        Self {
            config,
            encoder,
            processes,
            store,
        }
    }
}

/// Starts the orchestrator.
///
/// Builds the encoder from `[encoder]`, sweeps workers left behind by a
/// previous run, and serves until Ctrl-C or SIGTERM. On shutdown every
/// tracked worker is terminated and the model is dropped.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    std::fs::create_dir_all(&config.storage.base_path)?;
    let config = Arc::new(config);

    if !config.encoder.is_enabled() {
        tracing::warn!("encoder backend is disabled; indexing and query jobs will fail to load a model");
    }
    let backend = create_backend(&config.encoder)?;
    let encoder = Arc::new(SharedEncoder::new(backend));
    encoder.initialize(config.encoder.model_path.as_deref());

    let store = Arc::new(StatusStore::new(&config.storage.base_path));
    let launcher = Arc::new(SelfExecLauncher::current()?);
    let processes = Arc::new(ProcessManager::new(config.clone(), store, launcher));

    let prefix = config.workers.name_prefix.clone();
    let stale = tokio::task::spawn_blocking(move || sweep_orphans(&prefix, &HashSet::new())).await?;
    if !stale.is_empty() {
        tracing::warn!("killed {} workers left by a previous run: {:?}", stale.len(), stale);
    }

    let state = AppState::new(config.clone(), encoder.clone(), processes.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        "framehub listening on http://{} (encoder backend: {}, workers reach it at {})",
        listener.local_addr()?,
        config.encoder.backend,
        config.server.encoder_base_url()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, terminating workers");
    let report = tokio::task::spawn_blocking(move || processes.cleanup()).await?;
    tracing::info!(
        "terminated {} jobs, swept {} untracked workers",
        report.terminated.len(),
        report.swept.len()
    );
    encoder.cleanup();
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, whichever arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

/// All routes, with permissive CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/encoder/status", get(handle_encoder_status))
        .route("/api/encoder/load", post(handle_encoder_load))
        .route("/api/encoder/release", post(handle_encoder_release))
        .route("/api/encoder/encode/video", post(handle_encode_video))
        .route("/api/encoder/encode/query", post(handle_encode_query))
        .route("/api/sessions/{id}", axum::routing::delete(handle_delete_session))
        .route("/api/sessions/{id}/index", post(handle_start_indexing))
        .route("/api/sessions/{id}/query", post(handle_start_query))
        .route("/api/sessions/{id}/status", get(handle_session_status))
        .route("/api/sessions/{id}/videos", get(handle_session_videos))
        .route("/api/sessions/{id}/progress", get(handle_session_progress))
        .route("/api/sessions/{id}/terminate", post(handle_terminate))
        .route("/api/system/status", get(handle_system_status))
        .route("/api/system/processes", get(handle_system_processes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) | Error::UnknownStage(_) => StatusCode::BAD_REQUEST,
            Error::ResourceNotReady(_)
            | Error::JobAlreadyRunning { .. }
            | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::Remote { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

/// Run blocking library code off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| internal(format!("blocking task failed: {}", e)))?
        .map_err(AppError::from)
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| bad_request(e.body_text()))
}

fn session_id(id: &str) -> ApiResult<()> {
    validate_session_id(id).map_err(|e| bad_request(e.to_string()))
}

fn ensure_session(state: &AppState, id: &str) -> ApiResult<()> {
    if state.store.session_paths(id).root.exists() {
        Ok(())
    } else {
        Err(not_found(format!("session not found: {}", id)))
    }
}

// ============ GET /health ============

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

// ============ /api/encoder ============

async fn handle_encoder_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    // Waits for the model lock, which an encode may hold for minutes.
    let encoder = state.encoder.clone();
    let status = blocking(move || Ok(encoder.status())).await?;
    Ok(Json(StatusResponse {
        success: true,
        status,
    }))
}

async fn handle_encoder_load(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let encoder = state.encoder.clone();
    let status = blocking(move || {
        encoder.ensure_loaded()?;
        Ok(encoder.status())
    })
    .await?;
    Ok(Json(StatusResponse {
        success: true,
        status,
    }))
}

async fn handle_encoder_release(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let encoder = state.encoder.clone();
    let status = blocking(move || {
        encoder.release();
        Ok(encoder.status())
    })
    .await?;
    Ok(Json(StatusResponse {
        success: true,
        status,
    }))
}

async fn handle_encode_video(
    State(state): State<AppState>,
    payload: std::result::Result<Json<EncodeVideoRequest>, JsonRejection>,
) -> ApiResult<Json<EncodeResponse>> {
    let request = body(payload)?;
    let encoder = state.encoder.clone();
    let batch_size = request.video_batch.len();
    let rows = blocking(move || encoder.encode_video_segments(&request.video_batch)).await?;
    let dims = rows.first().map_or(0, Vec::len);
    Ok(Json(EncodeResponse {
        success: true,
        result: matrix_to_base64(&rows)?,
        shape: [rows.len(), dims],
        dtype: "float32".to_string(),
        batch_size: Some(batch_size),
        query: None,
    }))
}

async fn handle_encode_query(
    State(state): State<AppState>,
    payload: std::result::Result<Json<EncodeQueryRequest>, JsonRejection>,
) -> ApiResult<Json<EncodeResponse>> {
    let request = body(payload)?;
    let encoder = state.encoder.clone();
    let query = request.query.clone();
    let vector = blocking(move || encoder.encode_string_query(&query)).await?;
    let dims = vector.len();
    Ok(Json(EncodeResponse {
        success: true,
        result: matrix_to_base64(&[vector])?,
        shape: [1, dims],
        dtype: "float32".to_string(),
        batch_size: None,
        query: Some(request.query),
    }))
}

// ============ /api/sessions ============

#[derive(Deserialize)]
struct IndexRequest {
    video_paths: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Deserialize)]
struct StatusParams {
    kind: Option<String>,
}

async fn handle_start_indexing(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<IndexRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    let request = body(payload)?;
    let processes = state.processes.clone();
    let sid = id.clone();
    let info = blocking(move || processes.start_indexing(&sid, request.video_paths)).await?;
    Ok(Json(json!({ "success": true, "session_id": id, "process": info })))
}

async fn handle_start_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    let request = body(payload)?;
    let processes = state.processes.clone();
    let sid = id.clone();
    let info = blocking(move || processes.start_query(&sid, &request.query)).await?;
    Ok(Json(json!({ "success": true, "session_id": id, "process": info })))
}

async fn handle_session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<JobKind>)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;

    let processes = state.processes.clone();
    let store = state.store.clone();
    let sid = id.clone();
    let (status, running) = blocking(move || {
        Ok(match kind {
            Some(kind) => (processes.status(&sid, kind), processes.is_running(&sid, kind)),
            None => {
                let doc = store.read(&store.session_paths(&sid).status_file());
                let running = processes.is_running(&sid, JobKind::Index)
                    || processes.is_running(&sid, JobKind::Query);
                (doc, running)
            }
        })
    })
    .await?;

    Ok(Json(json!({
        "success": true,
        "session_id": id,
        "kind": kind,
        "running": running,
        "status": status,
    })))
}

async fn handle_session_videos(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    let store = state.store.clone();
    let sid = id.clone();
    let videos = blocking(move || Ok(store.indexed_videos(&sid))).await?;
    Ok(Json(json!({ "success": true, "session_id": id, "indexed_videos": videos })))
}

async fn handle_session_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    ensure_session(&state, &id)?;
    let base = state.config.storage.base_path.clone();
    let sid = id.clone();
    let progress = blocking(move || Ok(ArtifactStore::open(&base, &sid)?.progress())).await?;
    Ok(Json(json!({ "success": true, "progress": progress })))
}

async fn handle_terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    ensure_session(&state, &id)?;
    let processes = state.processes.clone();
    let sid = id.clone();
    let keys = blocking(move || processes.terminate(&sid)).await?;
    Ok(Json(json!({ "success": true, "session_id": id, "terminated": keys })))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    session_id(&id)?;
    ensure_session(&state, &id)?;
    let processes = state.processes.clone();
    let sid = id.clone();
    let deleted = blocking(move || processes.delete_session(&sid)).await?;
    Ok(Json(json!({ "success": true, "session_id": id, "deleted": deleted })))
}

// ============ /api/system ============

async fn handle_system_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let processes = state.processes.clone();
    let encoder = state.encoder.clone();
    let (active, count, encoder) = blocking(move || {
        Ok((
            processes.active_sessions(),
            processes.processes().len(),
            encoder.status(),
        ))
    })
    .await?;
    Ok(Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "encoder": encoder,
        "active_sessions": active,
        "tracked_processes": count,
    })))
}

async fn handle_system_processes(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let processes = state.processes.clone();
    let list = blocking(move || Ok(processes.processes())).await?;
    Ok(Json(json!({ "success": true, "processes": list })))
}
