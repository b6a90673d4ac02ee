//! Object storage for published platform binaries

use async_trait::async_trait;
use bytes::Bytes;
use nightly_common::{BuildError, Platform, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Durable blob storage keyed by `(commit, platform)`
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a binary and return its public URL
    async fn upload(&self, commit_hash: &str, platform: Platform, file: &Path) -> Result<String>;

    /// Fetch a previously published artifact by public URL
    async fn download(&self, url: &str) -> Result<Bytes>;
}

/// Artifact store speaking plain HTTP to an object storage bucket.
///
/// Objects are written with `PUT {bucket}/{prefix}/{commit}/{file}` and
/// served from `{public}/{prefix}/{commit}/{file}`.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    bucket_url: String,
    public_url: String,
    prefix: String,
    binary_name: String,
    upload_token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(
        bucket_url: &str,
        public_url: Option<&str>,
        prefix: &str,
        binary_name: &str,
        upload_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("build-service/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            bucket_url: bucket_url.trim_end_matches('/').to_string(),
            public_url: public_url
                .unwrap_or(bucket_url)
                .trim_end_matches('/')
                .to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            binary_name: binary_name.to_string(),
            upload_token,
        })
    }

    /// Object key of a platform binary
    pub fn object_key(&self, commit_hash: &str, platform: Platform) -> String {
        let file = platform.binary_name(&self.binary_name);
        if self.prefix.is_empty() {
            format!("{}/{}", commit_hash, file)
        } else {
            format!("{}/{}/{}", self.prefix, commit_hash, file)
        }
    }

    pub fn public_url(&self, commit_hash: &str, platform: Platform) -> String {
        format!("{}/{}", self.public_url, self.object_key(commit_hash, platform))
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, commit_hash: &str, platform: Platform, file: &Path) -> Result<String> {
        let failed = |detail: String| BuildError::UploadFailed { platform, detail };

        let data = tokio::fs::read(file)
            .await
            .map_err(|e| failed(format!("reading {}: {}", file.display(), e)))?;
        let size = data.len();

        let target = format!("{}/{}", self.bucket_url, self.object_key(commit_hash, platform));
        let mut request = self
            .client
            .put(&target)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        if let Some(token) = &self.upload_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("{} {}", status, body)));
        }

        let url = self.public_url(commit_hash, platform);
        info!("Uploaded {} ({} bytes) to {}", platform, size, url);
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        debug!("Downloading artifact {}", url);
        let failed = |e: reqwest::Error| {
            BuildError::ArchiveAssemblyFailed(format!("downloading {}: {}", url, e))
        };

        self.client
            .get(url)
            .send()
            .await
            .map_err(failed)?
            .error_for_status()
            .map_err(failed)?
            .bytes()
            .await
            .map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: &str, public: Option<&str>) -> HttpArtifactStore {
        HttpArtifactStore::new(
            "https://bucket.example.com/",
            public,
            prefix,
            "tool",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_object_keys() {
        let s = store("/builds/", None);
        assert_eq!(s.object_key("abc123", Platform::Linux), "builds/abc123/tool-linux");
        assert_eq!(
            s.public_url("abc123", Platform::Windows),
            "https://bucket.example.com/builds/abc123/tool-windows.exe"
        );

        let bare = store("", None);
        assert_eq!(bare.object_key("abc123", Platform::Macos), "abc123/tool-macos");
    }

    #[test]
    fn test_public_base_overrides_bucket() {
        let s = store("builds", Some("https://cdn.example.com"));
        assert_eq!(
            s.public_url("abc123", Platform::Linux),
            "https://cdn.example.com/builds/abc123/tool-linux"
        );
    }
}
