//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use build_service::{
    ArtifactStore, BuildCatalog, BuildRecordStore, MemoryArtifactStore, MemoryRecordStore,
    Orchestrator, Packager, SourceProvider,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use nightly_common::{ArtifactUrls, BuildError, BuildRecord, CommitInfo, Platform, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn commit(hash: &str) -> CommitInfo {
    CommitInfo {
        commit_hash: hash.to_string(),
        author: "Alice".to_string(),
        message: format!("Commit {}", hash),
        authored_date: base_time(),
    }
}

/// A well-formed record published `minutes` after the base time
pub fn record(hash: &str, minutes: i64, stable: Option<bool>) -> BuildRecord {
    let urls = Platform::ALL
        .iter()
        .map(|p| (*p, MemoryArtifactStore::url_for(hash, *p)))
        .collect();
    let mut record = BuildRecord::new(
        commit(hash),
        base_time() + Duration::minutes(minutes),
        ArtifactUrls::from_map(urls).unwrap(),
    );
    record.stable = stable;
    record
}

/// Put a distinct fake binary for every platform of `hash`
pub fn seed_artifacts(store: &MemoryArtifactStore, hash: &str) {
    for platform in Platform::ALL {
        store.put(
            &MemoryArtifactStore::url_for(hash, platform),
            format!("binary {} {}", hash, platform).into_bytes(),
        );
    }
}

/// Source provider with a settable upstream head
pub struct FakeSource {
    head: Mutex<Option<CommitInfo>>,
    pub snapshots: AtomicUsize,
}

impl FakeSource {
    pub fn new(hash: &str) -> Self {
        Self {
            head: Mutex::new(Some(commit(hash))),
            snapshots: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, hash: &str) {
        *self.head.lock().unwrap() = Some(commit(hash));
    }

    /// Make `latest_commit` fail as if the host were down
    pub fn go_offline(&self) {
        *self.head.lock().unwrap() = None;
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn latest_commit(&self) -> Result<CommitInfo> {
        self.head
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BuildError::UpstreamUnavailable("connection refused".to_string()))
    }

    async fn fetch_snapshot(&self, commit_hash: &str, dest: &Path) -> Result<PathBuf> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest.join("REVISION"), commit_hash).await?;
        Ok(dest.to_path_buf())
    }
}

/// Which packager stage should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Nothing,
    Install,
    Build,
    Package(Platform),
}

/// Packager writing the source revision into each "binary"
pub struct FakePackager {
    fail_at: Mutex<FailAt>,
    /// Signalled when install starts; install then waits for `release`
    pub entered: Option<Arc<Notify>>,
    pub release: Option<Arc<Notify>>,
    pub packaged: AtomicUsize,
}

impl FakePackager {
    pub fn new() -> Self {
        Self {
            fail_at: Mutex::new(FailAt::Nothing),
            entered: None,
            release: None,
            packaged: AtomicUsize::new(0),
        }
    }

    /// A packager whose install step blocks until released
    pub fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            entered: Some(entered),
            release: Some(release),
            ..Self::new()
        }
    }

    pub fn fail_at(&self, stage: FailAt) {
        *self.fail_at.lock().unwrap() = stage;
    }

    fn failing(&self) -> FailAt {
        *self.fail_at.lock().unwrap()
    }
}

#[async_trait]
impl Packager for FakePackager {
    async fn install_dependencies(&self, _project_dir: &Path) -> Result<()> {
        if let (Some(entered), Some(release)) = (&self.entered, &self.release) {
            entered.notify_one();
            release.notified().await;
        }
        if self.failing() == FailAt::Install {
            return Err(BuildError::DependencyInstallFailed("exit status 1".to_string()));
        }
        Ok(())
    }

    async fn build_project(&self, _project_dir: &Path) -> Result<()> {
        if self.failing() == FailAt::Build {
            return Err(BuildError::ProjectBuildFailed("exit status 2".to_string()));
        }
        Ok(())
    }

    async fn package(&self, project_dir: &Path, platform: Platform) -> Result<PathBuf> {
        if self.failing() == FailAt::Package(platform) {
            return Err(BuildError::PackagingFailed {
                platform,
                detail: "exit status 1".to_string(),
            });
        }
        let revision = tokio::fs::read_to_string(project_dir.join("REVISION")).await?;
        let out = project_dir.join(platform.binary_name("tool"));
        tokio::fs::write(&out, format!("binary {} {}", revision, platform)).await?;
        self.packaged.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }
}

/// Artifact store that rejects uploads for one platform
pub struct RejectingArtifactStore {
    pub inner: MemoryArtifactStore,
    pub reject: Platform,
}

#[async_trait]
impl ArtifactStore for RejectingArtifactStore {
    async fn upload(&self, commit_hash: &str, platform: Platform, file: &Path) -> Result<String> {
        if platform == self.reject {
            return Err(BuildError::UploadFailed {
                platform,
                detail: "403 Forbidden".to_string(),
            });
        }
        self.inner.upload(commit_hash, platform, file).await
    }

    async fn download(&self, url: &str) -> Result<bytes::Bytes> {
        self.inner.download(url).await
    }
}

/// Artifact store that reports an empty URL for one platform
pub struct BlankUrlArtifactStore {
    pub inner: MemoryArtifactStore,
    pub blank: Platform,
}

#[async_trait]
impl ArtifactStore for BlankUrlArtifactStore {
    async fn upload(&self, commit_hash: &str, platform: Platform, file: &Path) -> Result<String> {
        let url = self.inner.upload(commit_hash, platform, file).await?;
        if platform == self.blank {
            return Ok(String::new());
        }
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<bytes::Bytes> {
        self.inner.download(url).await
    }
}

/// Record store whose writes always fail; reads go to the inner store
#[derive(Default)]
pub struct FailingRecordStore {
    pub inner: MemoryRecordStore,
}

#[async_trait]
impl BuildRecordStore for FailingRecordStore {
    async fn append(&self, _record: &BuildRecord) -> Result<()> {
        Err(BuildError::Storage("connection reset by peer".to_string()))
    }

    async fn list(&self, limit: usize, stable: Option<bool>) -> Result<Vec<BuildRecord>> {
        self.inner.list(limit, stable).await
    }

    async fn find_by_commit(&self, commit_hash: &str) -> Result<Option<BuildRecord>> {
        self.inner.find_by_commit(commit_hash).await
    }
}

/// Orchestrator wired to in-memory collaborators
pub struct Harness {
    pub source: Arc<FakeSource>,
    pub packager: Arc<FakePackager>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub records: Arc<MemoryRecordStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(head: &str, records: Vec<BuildRecord>) -> Self {
        Self::with_packager(head, records, FakePackager::new())
    }

    pub fn with_packager(head: &str, records: Vec<BuildRecord>, packager: FakePackager) -> Self {
        let source = Arc::new(FakeSource::new(head));
        let packager = Arc::new(packager);
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let records = Arc::new(MemoryRecordStore::with_records(records));
        let work_dir = tempfile::tempdir().unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            source.clone(),
            packager.clone(),
            artifacts.clone(),
            records.clone(),
            work_dir.path().to_path_buf(),
        ));

        Self {
            source,
            packager,
            artifacts,
            records,
            orchestrator,
            work_dir,
        }
    }

    /// Leftover entries in the work directory
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.work_dir.path()).unwrap().count()
    }
}

/// Catalog over in-memory stores, caching into a fresh temp directory
pub fn catalog(
    records: Vec<BuildRecord>,
) -> (BuildCatalog, Arc<MemoryArtifactStore>, tempfile::TempDir) {
    let artifacts = Arc::new(MemoryArtifactStore::new());
    for r in &records {
        seed_artifacts(&artifacts, r.commit_hash());
    }
    let cache = tempfile::tempdir().unwrap();
    let catalog = BuildCatalog::new(
        Arc::new(MemoryRecordStore::with_records(records)),
        artifacts.clone(),
        cache.path().to_path_buf(),
        "tool",
    );
    (catalog, artifacts, cache)
}
