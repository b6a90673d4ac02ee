use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commit::CommitInfo;

/// Target platform of a packaged binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Windows,
    Macos,
}

impl Platform {
    /// Every platform a build must produce, in publish order
    pub const ALL: [Platform; 3] = [Platform::Linux, Platform::Windows, Platform::Macos];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Macos => "macos",
        }
    }

    /// File name of the binary for this platform, e.g. `app-windows.exe`
    pub fn binary_name(&self, base: &str) -> String {
        match self {
            Platform::Windows => format!("{}-{}.exe", base, self.as_str()),
            _ => format!("{}-{}", base, self.as_str()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public download URLs, one per required platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUrls {
    pub linux: String,
    pub windows: String,
    pub macos: String,
}

impl ArtifactUrls {
    pub fn get(&self, platform: Platform) -> &str {
        match platform {
            Platform::Linux => &self.linux,
            Platform::Windows => &self.windows,
            Platform::Macos => &self.macos,
        }
    }

    /// Build from a platform map; `None` when any platform is missing or empty.
    pub fn from_map(mut urls: HashMap<Platform, String>) -> Option<Self> {
        let mut take = |p: Platform| urls.remove(&p).filter(|u| !u.is_empty());
        Some(Self {
            linux: take(Platform::Linux)?,
            windows: take(Platform::Windows)?,
            macos: take(Platform::Macos)?,
        })
    }
}

/// One completed, published build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub commit_info: CommitInfo,

    /// Sort key; strictly increasing across records
    pub date_published: DateTime<Utc>,

    pub artifact_urls: ArtifactUrls,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
}

impl BuildRecord {
    pub fn new(
        commit_info: CommitInfo,
        date_published: DateTime<Utc>,
        artifact_urls: ArtifactUrls,
    ) -> Self {
        Self {
            commit_info,
            date_published,
            artifact_urls,
            notes: None,
            stable: None,
        }
    }

    pub fn commit_hash(&self) -> &str {
        &self.commit_info.commit_hash
    }

    /// Unset counts as not stable
    pub fn is_stable(&self) -> bool {
        self.stable.unwrap_or(false)
    }

    /// Whether this record passes a listing filter on the stable flag
    pub fn matches_stable(&self, filter: Option<bool>) -> bool {
        filter.map_or(true, |want| self.is_stable() == want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> HashMap<Platform, String> {
        Platform::ALL
            .iter()
            .map(|p| (*p, format!("https://cdn.example.com/abc/{}", p)))
            .collect()
    }

    #[test]
    fn test_binary_names() {
        assert_eq!(Platform::Linux.binary_name("app"), "app-linux");
        assert_eq!(Platform::Windows.binary_name("app"), "app-windows.exe");
        assert_eq!(Platform::Macos.binary_name("app"), "app-macos");
    }

    #[test]
    fn test_artifact_urls_require_every_platform() {
        assert!(ArtifactUrls::from_map(urls()).is_some());

        let mut missing = urls();
        missing.remove(&Platform::Macos);
        assert!(ArtifactUrls::from_map(missing).is_none());

        let mut empty = urls();
        empty.insert(Platform::Windows, String::new());
        assert!(ArtifactUrls::from_map(empty).is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let commit = CommitInfo {
            commit_hash: "abc123".to_string(),
            author: "alice".to_string(),
            message: "fix".to_string(),
            authored_date: Utc::now(),
        };
        let record = BuildRecord::new(commit, Utc::now(), ArtifactUrls::from_map(urls()).unwrap());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["commitInfo"]["commitHash"], "abc123");
        assert!(json["datePublished"].is_string());
        assert!(json["artifactUrls"]["windows"].is_string());
        assert!(json.get("stable").is_none());
    }

    #[test]
    fn test_stable_filter() {
        let commit = CommitInfo {
            commit_hash: "abc123".to_string(),
            author: "alice".to_string(),
            message: "fix".to_string(),
            authored_date: Utc::now(),
        };
        let mut record =
            BuildRecord::new(commit, Utc::now(), ArtifactUrls::from_map(urls()).unwrap());

        assert!(record.matches_stable(None));
        assert!(record.matches_stable(Some(false)));
        assert!(!record.matches_stable(Some(true)));

        record.stable = Some(true);
        assert!(record.matches_stable(Some(true)));
        assert!(!record.matches_stable(Some(false)));
    }
}
