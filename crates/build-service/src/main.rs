//! Build Service
//!
//! Periodic build orchestrator + REST API for listing and downloading builds

use anyhow::{Context, Result};
use build_service::{
    create_router, AppState, ArtifactStore, BuildCatalog, BuildRecordStore, CommandPackager,
    Config, GithubSource, HttpArtifactStore, MemoryArtifactStore, MemoryRecordStore, Orchestrator,
    RedisRecordStore, StorageBackend,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "build_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Build Service");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Source repository: {}", config.source_repo);
    info!("  Storage backend: {:?}", config.storage_backend);
    info!("  Data directory: {}", config.data_dir.display());
    info!("  Polling interval: {}s", config.polling_interval_secs);

    std::fs::create_dir_all(config.cache_dir()).context("Failed to create cache directory")?;
    std::fs::create_dir_all(config.work_dir()).context("Failed to create work directory")?;

    let (records, artifacts): (Arc<dyn BuildRecordStore>, Arc<dyn ArtifactStore>) =
        match config.storage_backend {
            StorageBackend::Redis => {
                let records = RedisRecordStore::new(
                    &config.redis_url,
                    &config.builds_table,
                    config.store_timeout(),
                )
                .await
                .context("Failed to initialize record storage")?;
                let bucket = config
                    .artifact_bucket_url
                    .as_deref()
                    .context("ARTIFACT_BUCKET_URL is not set")?;
                let artifacts = HttpArtifactStore::new(
                    bucket,
                    config.artifact_public_url.as_deref(),
                    &config.artifact_prefix,
                    &config.binary_name,
                    config.artifact_upload_token.clone(),
                    config.http_timeout(),
                )
                .context("Failed to initialize artifact storage")?;
                let records: Arc<dyn BuildRecordStore> = Arc::new(records);
                let artifacts: Arc<dyn ArtifactStore> = Arc::new(artifacts);
                (records, artifacts)
            }
            StorageBackend::Memory => {
                info!("Using in-memory storage; builds are lost on restart");
                let records: Arc<dyn BuildRecordStore> = Arc::new(MemoryRecordStore::new());
                let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
                (records, artifacts)
            }
        };

    let source = GithubSource::new(
        &config.source_api_url,
        &config.source_repo,
        config.source_branch.clone(),
        config.source_token.clone(),
        config.http_timeout(),
    )
    .context("Failed to initialize source client")?;

    let packager = CommandPackager::new(
        &config.install_command,
        &config.build_command,
        &config.package_command,
        &config.binary_name,
        config.step_timeout(),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(source),
        Arc::new(packager),
        artifacts.clone(),
        records.clone(),
        config.work_dir(),
    ));

    let catalog = BuildCatalog::new(records, artifacts, config.cache_dir(), &config.binary_name);
    let app = create_router(AppState {
        catalog: Arc::new(catalog),
    });

    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!("Build Service API running on http://{}", addr);

    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {:#}", e);
        }
    });

    let interval = config.polling_interval();
    let orchestrator_task = tokio::spawn(orchestrator.run(interval));

    tokio::select! {
        _ = api_task => {
            error!("API task terminated unexpectedly");
        }
        _ = orchestrator_task => {
            error!("Orchestrator task terminated unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down Build Service");

    Ok(())
}
