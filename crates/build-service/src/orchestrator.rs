//! Build orchestrator - decides when a build is needed and drives the pipeline

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nightly_common::{ArtifactUrls, BuildError, BuildRecord, CommitInfo, Platform, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::packager::Packager;
use crate::source::SourceProvider;
use crate::storage::BuildRecordStore;

/// Pipeline stage of an active run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Checking,
    Fetching,
    Installing,
    Building,
    Packaging,
    Uploading,
    Recording,
}

/// Orchestrator run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(Stage),
}

/// What a staleness check ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Another run was active; nothing was checked
    Skipped,
    /// The most recent build already matches upstream
    UpToDate(String),
    /// A new build was published
    Built(BuildRecord),
    /// The check or the pipeline failed; logged and dropped
    Failed(String),
}

/// Marks the orchestrator as running until dropped
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl RunGuard<'_> {
    fn enter(&self, stage: Stage) {
        debug!("Pipeline stage: {:?}", stage);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RunState::Running(stage);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RunState::Idle;
    }
}

/// Build orchestrator
pub struct Orchestrator {
    source: Arc<dyn SourceProvider>,
    packager: Arc<dyn Packager>,
    artifacts: Arc<dyn ArtifactStore>,
    records: Arc<dyn BuildRecordStore>,

    /// Parent directory of per-run workspaces
    work_dir: PathBuf,

    state: Mutex<RunState>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        source: Arc<dyn SourceProvider>,
        packager: Arc<dyn Packager>,
        artifacts: Arc<dyn ArtifactStore>,
        records: Arc<dyn BuildRecordStore>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            packager,
            artifacts,
            records,
            work_dir,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the run slot, or `None` if a run is already active
    fn try_begin(&self) -> Option<RunGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != RunState::Idle {
            return None;
        }
        *state = RunState::Running(Stage::Checking);
        Some(RunGuard { state: &self.state })
    }

    /// Latest commit on the polled ref
    pub async fn get_latest_commit_info(&self) -> Result<CommitInfo> {
        self.source.latest_commit().await
    }

    /// Most recent published build
    pub async fn get_current_build_info(&self) -> Result<BuildRecord> {
        self.records
            .latest(false)
            .await?
            .ok_or(BuildError::NoBuildsFound)
    }

    /// Compare upstream with the most recent build and build when stale.
    ///
    /// Never fails: errors are logged and the next tick retries.
    pub async fn check_and_build(&self) -> CheckOutcome {
        let Some(guard) = self.try_begin() else {
            info!("A build is already running, skipping check");
            return CheckOutcome::Skipped;
        };

        match self.check(&guard).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Build check failed: {}", e);
                CheckOutcome::Failed(e.to_string())
            }
        }
    }

    async fn check(&self, guard: &RunGuard<'_>) -> Result<CheckOutcome> {
        let latest = self.get_latest_commit_info().await?;

        match self.get_current_build_info().await {
            Err(BuildError::NoBuildsFound) => {
                info!("No builds recorded yet, building {}", latest.commit_hash);
            }
            Err(e) => return Err(e),
            Ok(current) if current.commit_info.same_revision(&latest) => {
                info!("Build is up to date at {}", latest.commit_hash);
                return Ok(CheckOutcome::UpToDate(latest.commit_hash));
            }
            Ok(current) => {
                info!(
                    "New commit {} (last build {}), building",
                    latest.commit_hash,
                    current.commit_hash()
                );
            }
        }

        let record = self.execute(guard, &latest).await?;
        Ok(CheckOutcome::Built(record))
    }

    /// Run the full pipeline for `commit` unconditionally
    pub async fn run_pipeline(&self, commit: &CommitInfo) -> Result<BuildRecord> {
        let guard = self.try_begin().ok_or(BuildError::Busy)?;
        self.execute(&guard, commit).await
    }

    async fn execute(&self, guard: &RunGuard<'_>, commit: &CommitInfo) -> Result<BuildRecord> {
        let hash = commit.commit_hash.as_str();
        info!("Starting pipeline for {} ({})", hash, commit.message.lines().next().unwrap_or(""));

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let workspace = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(&self.work_dir)?;

        let result = self.stages(guard, commit, workspace.path().to_path_buf()).await;
        match &result {
            Ok(_) => info!("Pipeline finished for {}", hash),
            Err(e) => warn!("Pipeline aborted for {}: {}", hash, e),
        }
        result
    }

    async fn stages(
        &self,
        guard: &RunGuard<'_>,
        commit: &CommitInfo,
        workspace: PathBuf,
    ) -> Result<BuildRecord> {
        let hash = commit.commit_hash.as_str();

        guard.enter(Stage::Fetching);
        let project = self.source.fetch_snapshot(hash, &workspace).await?;

        guard.enter(Stage::Installing);
        self.packager.install_dependencies(&project).await?;

        guard.enter(Stage::Building);
        self.packager.build_project(&project).await?;

        guard.enter(Stage::Packaging);
        let mut binaries = Vec::with_capacity(Platform::ALL.len());
        for platform in Platform::ALL {
            let binary = self.packager.package(&project, platform).await?;
            info!("Packaged {} binary at {}", platform, binary.display());
            binaries.push((platform, binary));
        }

        // Uploads from earlier platforms stay in place if a later one fails
        guard.enter(Stage::Uploading);
        let mut urls = HashMap::new();
        for (platform, binary) in &binaries {
            let url = self.artifacts.upload(hash, *platform, binary).await?;
            if url.is_empty() {
                return Err(BuildError::UploadFailed {
                    platform: *platform,
                    detail: "artifact store returned an empty URL".to_string(),
                });
            }
            urls.insert(*platform, url);
        }
        let artifact_urls = ArtifactUrls::from_map(urls).ok_or_else(|| {
            BuildError::RecordWriteFailed("incomplete artifact URL set".to_string())
        })?;

        guard.enter(Stage::Recording);
        let published = self.next_publish_date().await;
        let record = BuildRecord::new(commit.clone(), published, artifact_urls);
        self.records.append(&record).await.map_err(|e| match e {
            BuildError::RecordWriteFailed(_) => e,
            other => BuildError::RecordWriteFailed(other.to_string()),
        })?;

        Ok(record)
    }

    /// Publish timestamp strictly after the most recent record
    async fn next_publish_date(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.records.latest(false).await {
            Ok(Some(previous)) => {
                now.max(previous.date_published + ChronoDuration::milliseconds(1))
            }
            Ok(None) => now,
            Err(e) => {
                warn!("Could not read previous build for ordering: {}", e);
                now
            }
        }
    }

    /// Check for new commits every `interval`, forever
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!(
            "Starting build orchestrator (checking every {} seconds)",
            interval.as_secs()
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.check_and_build().await {
                CheckOutcome::Built(record) => {
                    info!("Published build for {}", record.commit_hash());
                }
                outcome => debug!("Check finished: {:?}", outcome),
            }
        }
    }
}
