//! REST + SSE endpoints.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::jobs::artifact;
use crate::jobs::{DownloadAccepted, DownloadRequest, JobId, JobRegistry, JobSupervisor};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub supervisor: Arc<JobSupervisor>,
    /// Where finished artifacts are served from.
    pub downloads_dir: PathBuf,
}

/// Build the Axum router for the relay.
pub fn relay_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/download", post(start_download))
        .route("/events/{job_id}", get(job_events))
        .route("/file/{filename}", get(download_file))
        .route("/jobs", get(list_jobs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "media-relay"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

fn missing_url() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": JobError::MissingUrl.to_string()})),
    )
        .into_response()
}

async fn start_download(
    State(state): State<AppState>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Response {
    // A body that is absent, not JSON, or mistyped carries no usable URL.
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            debug!(status = %rejection.status(), reason = %rejection.body_text(), "Unusable download request body");
            return missing_url();
        }
    };
    let Some(url) = body.source_url() else {
        return missing_url();
    };

    if let Err(e) = artifact::ensure_dir(&state.downloads_dir).await {
        error!(dir = %state.downloads_dir.display(), error = %e, "Cannot create downloads directory");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Downloads directory unavailable"})),
        )
            .into_response();
    }

    let ticket = match state.registry.admit(url, body.filename.as_deref()).await {
        Ok(ticket) => ticket,
        Err(JobError::TooManyJobs { active, max }) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Too many concurrent downloads",
                    "message": format!(
                        "Server is busy ({active}/{max} downloads in progress). Please try again in a few minutes."
                    ),
                    "activeJobs": active,
                    "maxJobs": max,
                })),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let job_id = ticket.id;
    info!(job_id = %job_id, url = %ticket.url, artifact = %ticket.artifact_name(), "Starting download job");
    state.supervisor.start(ticket);

    Json(DownloadAccepted { job_id }).into_response()
}

fn job_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Job not found"})),
    )
        .into_response()
}

/// GET /events/{job_id}: SSE stream of progress events, closed after the terminal one.
async fn job_events(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Ok(id) = job_id.parse::<JobId>() else {
        debug!(job_id = %job_id, "Malformed job id on attach");
        return job_not_found();
    };

    let mut listener = match state.registry.attach(id).await {
        Ok(listener) => listener,
        Err(e) => {
            debug!(job_id = %id, error = %e, "Attach rejected");
            return job_not_found();
        }
    };

    let stream = async_stream::stream! {
        while let Some(event) = listener.recv().await {
            let terminal = event.is_terminal();
            let json = serde_json::to_string(&event).unwrap_or_default();
            yield Ok::<Event, Infallible>(Event::default().data(json));
            if terminal {
                break;
            }
        }
        debug!(job_id = %id, listener = listener.id(), "Event stream closed");
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// GET /jobs: live jobs, oldest first.
async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot().await)
}

// ── Artifacts ───────────────────────────────────────────────────────────

async fn download_file(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    let Some(path) = artifact::resolve(&state.downloads_dir, &filename) else {
        warn!(filename = %filename, "Rejected artifact name");
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Artifact not available");
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
    };

    let content_type = if filename.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    };

    info!(filename = %filename, "Serving artifact");
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}
