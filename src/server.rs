//! HTTP transport for the review session.
//!
//! A thin axum router over [`ReviewSession`]: every handler deserializes a
//! request, calls one session operation on a blocking worker thread, and
//! serializes the result. All locking and persistence lives in the session;
//! the transport holds no state of its own beyond the shutdown signal.
//!
//! Session failures become JSON error responses with a 4xx/5xx status; a
//! panic or join failure on the worker becomes a generic 500. Static serving
//! is limited to the session's review root, with path containment enforced
//! after canonicalization.

use crate::session::{Manifest, ReviewSession, SessionError};
use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// The single-page review UI, served at `/`.
const REVIEW_PAGE: &str = include_str!("../assets/review.html");

/// Characters escaped in preview URLs. Slashes stay literal so the browser
/// sees the same hierarchy the review root has.
const URL_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

#[derive(Error, Debug)]
enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unexpected server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Session(err) => match err {
                SessionError::UnknownImage(_) => StatusCode::NOT_FOUND,
                SessionError::InvalidStatus(_)
                | SessionError::UnknownPreset(_)
                | SessionError::ModelUnavailable(_)
                | SessionError::Pipeline(_) => StatusCode::BAD_REQUEST,
                SessionError::Io(_) | SessionError::Json(_) | SessionError::Archive(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            axum::Json(json!({ "ok": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Clone)]
struct AppState {
    session: Arc<ReviewSession>,
    shutdown: Arc<Notify>,
}

pub fn router(session: Arc<ReviewSession>, shutdown: Arc<Notify>) -> Router {
    let state = AppState { session, shutdown };
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/api/state", get(api_state))
        .route("/api/decision", post(api_decision))
        .route("/api/rerun", post(api_rerun))
        .route("/api/finalize", post(api_finalize))
        .route("/api/shutdown", post(api_shutdown))
        .route("/preview/*path", get(serve_preview))
        .with_state(state)
}

/// Bind and serve until the shutdown endpoint fires. In-flight requests run
/// to completion; no new connections are accepted afterwards.
pub async fn run(
    session: Arc<ReviewSession>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let app = router(session, Arc::clone(&shutdown));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "review server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

async fn index() -> Html<&'static str> {
    Html(REVIEW_PAGE)
}

/// Session calls block on the coarse session lock (and, for rerun, on
/// external tools), so they run on the blocking pool.
async fn on_worker<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(ApiError::Session)
}

fn to_url_path(rel: &str) -> String {
    format!("/{}", utf8_percent_encode(rel, URL_UNSAFE))
}

/// The state payload is the manifest plus a computed preview URL per image.
fn state_payload(manifest: &Manifest) -> Result<serde_json::Value, SessionError> {
    let mut payload = serde_json::to_value(manifest)?;
    if let Some(images) = payload.get_mut("images").and_then(|v| v.as_array_mut()) {
        for image in images {
            for (path_key, url_key) in [
                ("preview_original_path", "preview_original_url"),
                ("preview_candidate_path", "preview_candidate_url"),
            ] {
                let url = image
                    .get(path_key)
                    .and_then(|v| v.as_str())
                    .map(to_url_path);
                if let (Some(url), Some(obj)) = (url, image.as_object_mut()) {
                    obj.insert(url_key.to_string(), json!(url));
                }
            }
        }
    }
    Ok(payload)
}

async fn api_state(State(state): State<AppState>) -> Result<Response, ApiError> {
    let session = Arc::clone(&state.session);
    let manifest = on_worker(move || Ok(session.snapshot())).await?;
    Ok(axum::Json(state_payload(&manifest)?).into_response())
}

#[derive(Deserialize)]
struct DecisionRequest {
    rel_path: String,
    status: String,
}

async fn api_decision(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<DecisionRequest>,
) -> Result<Response, ApiError> {
    let session = Arc::clone(&state.session);
    let summary = on_worker(move || session.decide(&req.rel_path, &req.status)).await?;
    Ok(axum::Json(json!({ "ok": true, "summary": summary })).into_response())
}

#[derive(Deserialize)]
struct RerunRequest {
    rel_path: String,
    preset: String,
}

async fn api_rerun(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<RerunRequest>,
) -> Result<Response, ApiError> {
    let session = Arc::clone(&state.session);
    let outcome = on_worker(move || session.rerun(&req.rel_path, &req.preset)).await?;
    Ok(axum::Json(json!({ "ok": true, "result": outcome })).into_response())
}

async fn api_finalize(State(state): State<AppState>) -> Result<Response, ApiError> {
    let session = Arc::clone(&state.session);
    let summary = on_worker(move || session.finalize()).await?;
    let mut payload = serde_json::to_value(&summary).map_err(SessionError::Json)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("ok".to_string(), json!(true));
    }
    Ok(axum::Json(payload).into_response())
}

async fn api_shutdown(State(state): State<AppState>) -> Response {
    tracing::info!("shutdown requested via API");
    state.shutdown.notify_one();
    axum::Json(json!({ "ok": true })).into_response()
}

/// Serve a preview file from under the review root. The decoded path is
/// re-rooted and canonicalized; anything resolving outside the root is
/// rejected before any read happens.
async fn serve_preview(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, ApiError> {
    let Ok(decoded) = percent_decode_str(&path).decode_utf8() else {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    };
    let rel = format!("preview/{decoded}");
    let root = state.session.review_root().to_path_buf();

    let response = tokio::task::spawn_blocking(move || {
        let Ok(root) = root.canonicalize() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let Ok(target) = root.join(&rel).canonicalize() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if !target.starts_with(&root) {
            return StatusCode::FORBIDDEN.into_response();
        }
        match std::fs::read(&target) {
            Ok(bytes) => {
                let content_type = match target.extension().and_then(|e| e.to_str()) {
                    Some("png") => "image/png",
                    Some("jpg") | Some("jpeg") => "image/jpeg",
                    _ => "application/octet-stream",
                };
                ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        }
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(response)
}
