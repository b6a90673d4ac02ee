use thiserror::Error;

use crate::record::Platform;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Upstream source unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("No builds found")]
    NoBuildsFound,

    #[error("Dependency install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("Project build failed: {0}")]
    ProjectBuildFailed(String),

    #[error("Packaging failed for {platform}: {detail}")]
    PackagingFailed { platform: Platform, detail: String },

    #[error("Upload failed for {platform}: {detail}")]
    UploadFailed { platform: Platform, detail: String },

    #[error("Failed to write build record: {0}")]
    RecordWriteFailed(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Archive assembly failed: {0}")]
    ArchiveAssemblyFailed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("A build is already running")]
    Busy,

    #[error("Record store error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// True for the "nothing matched" family, surfaced as 404 by the API.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BuildError::BuildNotFound(_) | BuildError::NoBuildsFound)
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
