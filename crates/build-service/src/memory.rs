//! In-process record and artifact stores
//!
//! Used for local development (`STORAGE_BACKEND=memory`) and by tests.
//! Nothing survives a restart.

use async_trait::async_trait;
use bytes::Bytes;
use nightly_common::{BuildError, BuildRecord, Platform, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::storage::BuildRecordStore;

/// Record store backed by a vector kept in publish order
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<BuildRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records, in any order
    pub fn with_records(records: Vec<BuildRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    fn insert(&self, record: BuildRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let pos = records.partition_point(|r| r.date_published <= record.date_published);
        records.insert(pos, record);
    }

    /// Total number of stored records, malformed or not
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BuildRecordStore for MemoryRecordStore {
    async fn append(&self, record: &BuildRecord) -> Result<()> {
        self.insert(record.clone());
        Ok(())
    }

    async fn list(&self, limit: usize, stable: Option<bool>) -> Result<Vec<BuildRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.matches_stable(stable))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_commit(&self, commit_hash: &str) -> Result<Option<BuildRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .rev()
            .find(|r| r.commit_hash() == commit_hash)
            .cloned())
    }
}

/// Artifact store holding blobs in a map keyed by `memory://` URL
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    downloads: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url_for(commit_hash: &str, platform: Platform) -> String {
        format!("memory://{}/{}", commit_hash, platform)
    }

    /// Place a blob directly, bypassing `upload`
    pub fn put(&self, url: &str, data: impl Into<Bytes>) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), data.into());
    }

    /// Number of `download` calls served so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(&self, commit_hash: &str, platform: Platform, file: &Path) -> Result<String> {
        let data = tokio::fs::read(file)
            .await
            .map_err(|e| BuildError::UploadFailed {
                platform,
                detail: e.to_string(),
            })?;

        let url = Self::url_for(commit_hash, platform);
        debug!("Stored {} bytes at {}", data.len(), url);
        self.put(&url, data);
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
            .ok_or_else(|| BuildError::ArchiveAssemblyFailed(format!("no artifact at {}", url)))
    }
}
