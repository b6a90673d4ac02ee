//! Build catalog - listings, latest pointers and downloadable archives

use nightly_common::{is_valid_commit_hash, ArtifactUrls, BuildError, BuildRecord, Platform, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::artifacts::ArtifactStore;
use crate::storage::BuildRecordStore;

/// File name of a completed archive inside a cache entry
pub const ARCHIVE_FILE: &str = "build.zip";

/// A completed archive ready to stream
#[derive(Debug)]
pub struct MaterializedArchive {
    pub size_bytes: u64,
    pub file: tokio::fs::File,
}

/// Read side of the service
pub struct BuildCatalog {
    records: Arc<dyn BuildRecordStore>,
    artifacts: Arc<dyn ArtifactStore>,
    cache_dir: PathBuf,
    binary_name: String,

    /// One lock per commit being materialized
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BuildCatalog {
    pub fn new(
        records: Arc<dyn BuildRecordStore>,
        artifacts: Arc<dyn ArtifactStore>,
        cache_dir: PathBuf,
        binary_name: &str,
    ) -> Self {
        Self {
            records,
            artifacts,
            cache_dir,
            binary_name: binary_name.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent builds first, at most `limit`
    pub async fn list_builds(&self, limit: usize, stable: Option<bool>) -> Result<Vec<BuildRecord>> {
        self.records.list(limit, stable).await
    }

    /// The newest build, or the newest stable build
    pub async fn latest_build(&self, stable_only: bool) -> Result<BuildRecord> {
        self.records.latest(stable_only).await?.ok_or_else(|| {
            BuildError::BuildNotFound(if stable_only { "latest stable" } else { "latest" }.to_string())
        })
    }

    /// Commit hash of the newest (stable) build
    pub async fn resolve_latest(&self, stable_only: bool) -> Result<String> {
        Ok(self.latest_build(stable_only).await?.commit_info.commit_hash)
    }

    /// Artifact URLs published for a commit
    pub async fn get_build_by_commit(&self, commit_hash: &str) -> Result<ArtifactUrls> {
        self.records
            .find_by_commit(commit_hash)
            .await?
            .map(|record| record.artifact_urls)
            .ok_or_else(|| BuildError::BuildNotFound(commit_hash.to_string()))
    }

    /// Download file name offered to clients
    pub fn archive_file_name(&self, commit_hash: &str) -> String {
        format!("{}-{}.zip", self.binary_name, commit_hash)
    }

    fn entry_dir(&self, commit_hash: &str) -> PathBuf {
        self.cache_dir.join(commit_hash)
    }

    fn lock_for(&self, commit_hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(commit_hash.to_string()).or_default().clone()
    }

    /// Return the cached archive for a commit, assembling it on first request
    pub async fn materialize_archive(&self, commit_hash: &str) -> Result<MaterializedArchive> {
        if !is_valid_commit_hash(commit_hash) {
            return Err(BuildError::BadRequest(format!("invalid commit hash: {}", commit_hash)));
        }

        let archive = self.entry_dir(commit_hash).join(ARCHIVE_FILE);
        if let Some(hit) = open_cached(&archive).await? {
            debug!("Archive cache hit for {}", commit_hash);
            return Ok(hit);
        }

        let urls = self.get_build_by_commit(commit_hash).await?;

        let lock = self.lock_for(commit_hash);
        let _held = lock.lock().await;

        // Another request may have finished while we waited
        if let Some(hit) = open_cached(&archive).await? {
            return Ok(hit);
        }

        self.assemble(commit_hash, &urls, &archive)
            .await
            .map_err(|e| match e {
                BuildError::ArchiveAssemblyFailed(_) => e,
                other => BuildError::ArchiveAssemblyFailed(other.to_string()),
            })?;

        open_cached(&archive).await?.ok_or_else(|| {
            BuildError::ArchiveAssemblyFailed(format!("{} vanished after assembly", archive.display()))
        })
    }

    async fn assemble(&self, commit_hash: &str, urls: &ArtifactUrls, archive: &Path) -> Result<()> {
        info!("Materializing archive for {}", commit_hash);
        let entry_dir = self.entry_dir(commit_hash);
        tokio::fs::create_dir_all(&entry_dir).await?;

        let mut files = Vec::with_capacity(Platform::ALL.len());
        for platform in Platform::ALL {
            let data = self.artifacts.download(urls.get(platform)).await?;
            let name = platform.binary_name(&self.binary_name);
            let path = entry_dir.join(&name);
            tokio::fs::write(&path, &data).await?;
            set_executable(&path).await?;
            files.push((name, path));
        }

        let partial = entry_dir.join(format!("{}.{}.tmp", ARCHIVE_FILE, uuid::Uuid::new_v4()));
        let target = partial.clone();
        let size = tokio::task::spawn_blocking(move || write_zip(&files, &target))
            .await
            .map_err(|e| BuildError::ArchiveAssemblyFailed(format!("archive task failed: {}", e)))?
            .map_err(|e| BuildError::ArchiveAssemblyFailed(e.to_string()));

        let size = match size {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, archive).await?;
        info!("Cached {} ({} bytes)", archive.display(), size);
        Ok(())
    }
}

async fn open_cached(archive: &Path) -> Result<Option<MaterializedArchive>> {
    match tokio::fs::File::open(archive).await {
        Ok(file) => {
            let size_bytes = file.metadata().await?.len();
            Ok(Some(MaterializedArchive { size_bytes, file }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Write a deflated zip of `files` to `dest`, returning its size
fn write_zip(files: &[(String, PathBuf)], dest: &Path) -> zip::result::ZipResult<u64> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);

    for (name, path) in files {
        zip.start_file(name.as_str(), options)?;
        let mut src = std::fs::File::open(path)?;
        std::io::copy(&mut src, &mut zip)?;
    }

    let file = zip.finish()?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}
