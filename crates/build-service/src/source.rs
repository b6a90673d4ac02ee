//! Source host access: latest commit and source snapshots

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use nightly_common::{BuildError, CommitInfo, Result};
use serde::Deserialize;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info, warn};

/// Source repository the pipeline builds from
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Latest commit on the polled ref
    async fn latest_commit(&self) -> Result<CommitInfo>;

    /// Unpack the source tree of `commit_hash` into `dest`, returning the project root
    async fn fetch_snapshot(&self, commit_hash: &str, dest: &Path) -> Result<PathBuf>;
}

/// The subset of a commit-history entry the pipeline reads
#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    author: CommitAuthor,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    name: String,
    date: DateTime<Utc>,
}

impl From<CommitEntry> for CommitInfo {
    fn from(entry: CommitEntry) -> Self {
        CommitInfo {
            commit_hash: entry.sha,
            author: entry.commit.author.name,
            message: entry.commit.message,
            authored_date: entry.commit.author.date,
        }
    }
}

/// Parse a commit-history response body into the newest commit
fn parse_latest_commit(body: &[u8]) -> Result<CommitInfo> {
    let entries: Vec<CommitEntry> = serde_json::from_slice(body)
        .map_err(|e| BuildError::UpstreamUnavailable(format!("unexpected commit response: {}", e)))?;

    entries
        .into_iter()
        .next()
        .map(CommitInfo::from)
        .ok_or_else(|| BuildError::UpstreamUnavailable("commit history is empty".to_string()))
}

/// GitHub REST API source provider
pub struct GithubSource {
    client: reqwest::Client,
    api_url: String,
    repo: String,
    branch: Option<String>,
    token: Option<String>,
}

impl GithubSource {
    pub fn new(
        api_url: &str,
        repo: &str,
        branch: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("build-service/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            branch,
            token,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_bytes(&self, request: reqwest::RequestBuilder) -> Result<bytes::Bytes> {
        let upstream = |e: reqwest::Error| BuildError::UpstreamUnavailable(e.to_string());
        request
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .bytes()
            .await
            .map_err(upstream)
    }
}

#[async_trait]
impl SourceProvider for GithubSource {
    async fn latest_commit(&self) -> Result<CommitInfo> {
        let url = format!("{}/repos/{}/commits", self.api_url, self.repo);
        let mut request = self.get(&url).query(&[("per_page", "1")]);
        if let Some(branch) = &self.branch {
            request = request.query(&[("sha", branch.as_str())]);
        }

        let body = self.fetch_bytes(request).await?;
        let commit = parse_latest_commit(&body)?;
        debug!("Latest upstream commit: {}", commit.commit_hash);
        Ok(commit)
    }

    async fn fetch_snapshot(&self, commit_hash: &str, dest: &Path) -> Result<PathBuf> {
        let url = format!("{}/repos/{}/tarball/{}", self.api_url, self.repo, commit_hash);
        info!("Downloading source snapshot {}", url);

        let bytes = self.fetch_bytes(self.get(&url)).await?;
        let root = dest.to_path_buf();

        tokio::task::spawn_blocking(move || extract_tar_gz_strip_top(&bytes, &root))
            .await
            .map_err(|e| BuildError::UpstreamUnavailable(format!("extract task failed: {}", e)))?
            .map_err(|e| BuildError::UpstreamUnavailable(format!("bad source archive: {}", e)))?;

        Ok(dest.to_path_buf())
    }
}

/// Extract a `.tar.gz` archive into `dest`, stripping the top-level directory.
pub(crate) fn extract_tar_gz_strip_top(bytes: &[u8], dest: &Path) -> std::io::Result<()> {
    let tar_gz = GzDecoder::new(Cursor::new(bytes));
    let mut archive = Archive::new(tar_gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let full_path = entry.path()?.to_path_buf();
        let components: Vec<_> = full_path.components().collect();
        if components.len() <= 1 {
            continue;
        }
        if !components[1..].iter().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Skipping archive entry outside the project: {}", full_path.display());
            continue;
        }
        let rel_path: PathBuf = components.iter().skip(1).collect();
        let dest_path = dest.join(rel_path);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(dest_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_parse_latest_commit() {
        let body = br#"[
            {
                "sha": "6dcb09b5b57875f334f61aebed695e2e4193db5e",
                "commit": {
                    "author": { "name": "Monalisa Octocat", "email": "m@example.com", "date": "2024-03-01T10:00:00Z" },
                    "message": "Fix all the bugs"
                },
                "url": "https://api.github.com/repos/octocat/Hello-World/commits/6dcb09b"
            }
        ]"#;

        let commit = parse_latest_commit(body).unwrap();
        assert_eq!(commit.commit_hash, "6dcb09b5b57875f334f61aebed695e2e4193db5e");
        assert_eq!(commit.author, "Monalisa Octocat");
        assert_eq!(commit.message, "Fix all the bugs");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let no_sha = br#"[{ "commit": { "author": { "name": "a", "date": "2024-03-01T10:00:00Z" }, "message": "m" } }]"#;
        assert!(matches!(
            parse_latest_commit(no_sha),
            Err(BuildError::UpstreamUnavailable(_))
        ));

        let no_author = br#"[{ "sha": "abc", "commit": { "message": "m" } }]"#;
        assert!(parse_latest_commit(no_author).is_err());

        assert!(parse_latest_commit(b"[]").is_err());
        assert!(parse_latest_commit(b"{\"message\": \"Not Found\"}").is_err());
    }

    #[test]
    fn test_extract_strips_top_directory() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let content = b"{\"name\": \"tool\"}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "acme-tool-6dcb09b/package.json", &content[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz_strip_top(&bytes, dest.path()).unwrap();

        let extracted = std::fs::read_to_string(dest.path().join("package.json")).unwrap();
        assert!(extracted.contains("tool"));
    }

    #[test]
    fn test_extract_skips_parent_dir_entries() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

        // Written raw; `set_path` refuses `..`
        let content = b"escaped";
        let name = b"acme-tool-6dcb09b/../../escape.txt";
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &content[..]).unwrap();

        let kept = b"ok";
        let mut header = tar::Header::new_gnu();
        header.set_size(kept.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "acme-tool-6dcb09b/src/main.js", &kept[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("a/b");
        std::fs::create_dir_all(&dest).unwrap();
        extract_tar_gz_strip_top(&bytes, &dest).unwrap();

        assert!(!root.path().join("a/escape.txt").exists());
        assert!(!root.path().join("escape.txt").exists());
        assert_eq!(std::fs::read(dest.join("src/main.js")).unwrap(), b"ok");
    }
}
