//! Build Service
//!
//! Polls a source repository for new commits, packages platform binaries,
//! publishes them to object storage and records each build. The HTTP API
//! lists builds and serves a zip of a build's binaries, assembled on first
//! request and cached on disk afterwards.

pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod handlers;
pub mod memory;
pub mod orchestrator;
pub mod packager;
pub mod source;
pub mod storage;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use artifacts::{ArtifactStore, HttpArtifactStore};
pub use catalog::{BuildCatalog, MaterializedArchive};
pub use config::{Config, StorageBackend};
pub use handlers::AppState;
pub use memory::{MemoryArtifactStore, MemoryRecordStore};
pub use orchestrator::{CheckOutcome, Orchestrator, RunState, Stage};
pub use packager::{CommandPackager, Packager};
pub use source::{GithubSource, SourceProvider};
pub use storage::{BuildRecordStore, RedisRecordStore};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/", get(handlers::list_builds_handler))
        .route("/health", get(handlers::health_handler))
        .route("/latest", get(handlers::latest_handler))
        .route("/latest/stable", get(handlers::latest_stable_handler))
        .route("/download/latest", get(handlers::download_latest_handler))
        .route(
            "/download/latest/stable",
            get(handlers::download_latest_stable_handler),
        )
        .route("/download/{commit_hash}", get(handlers::download_handler))
        .fallback(handlers::not_found_handler)
        .method_not_allowed_fallback(handlers::not_found_handler)
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
