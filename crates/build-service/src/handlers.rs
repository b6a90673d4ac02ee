//! API handlers for the Build Service

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use nightly_common::{BuildError, BuildRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::catalog::BuildCatalog;

/// Listing size when the caller gives none or an out-of-range one
pub const DEFAULT_LIMIT: usize = 10;

/// Listing sizes must stay below this
pub const MAX_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub catalog: Arc<BuildCatalog>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        let status = match &err {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            BuildError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Query string of the listing endpoint. Values are kept raw so that
/// malformed ones fall back to defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<String>,
    pub stable: Option<String>,
}

/// Listing response
#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub builds: Vec<BuildRecord>,
}

/// Requested limit if it lies in `1..MAX_LIMIT`, the default otherwise
pub fn clamp_limit(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| (1..MAX_LIMIT).contains(n))
        .unwrap_or(DEFAULT_LIMIT)
}

fn parse_stable(raw: Option<&str>) -> Option<bool> {
    match raw? {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "ok",
    )
}

/// List recent builds
pub async fn list_builds_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = clamp_limit(params.limit.as_deref());
    let stable = parse_stable(params.stable.as_deref());

    let builds = state.catalog.list_builds(limit, stable).await?;
    Ok(Json(ListResponse { builds }))
}

/// Most recent build
pub async fn latest_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BuildRecord>, ApiError> {
    Ok(Json(state.catalog.latest_build(false).await?))
}

/// Most recent stable build
pub async fn latest_stable_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BuildRecord>, ApiError> {
    Ok(Json(state.catalog.latest_build(true).await?))
}

async fn redirect_to_latest(state: &AppState, stable_only: bool) -> Result<Response, ApiError> {
    let commit_hash = state.catalog.resolve_latest(stable_only).await?;
    let location = format!("/download/{}", commit_hash);

    Ok((
        StatusCode::MOVED_PERMANENTLY,
        [
            (header::LOCATION, location),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response())
}

/// Redirect to the archive of the most recent build
pub async fn download_latest_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    redirect_to_latest(&state, false).await
}

/// Redirect to the archive of the most recent stable build
pub async fn download_latest_stable_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    redirect_to_latest(&state, true).await
}

/// Stream the archive of a build
pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(commit_hash): Path<String>,
) -> Result<Response, ApiError> {
    info!("Download requested for {}", commit_hash);

    let archive = state.catalog.materialize_archive(&commit_hash).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        state.catalog.archive_file_name(&commit_hash)
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, archive.size_bytes.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(archive.file)),
    )
        .into_response())
}

/// Anything unrouted
pub async fn not_found_handler() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "Not found".to_string(),
    }
}
