//! Redis storage for build records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nightly_common::{ArtifactUrls, BuildError, BuildRecord, CommitInfo, Platform, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Records scanned per round trip when filtering listings
const SCAN_PAGE: isize = 50;

/// Append-only table of published builds, newest first
#[async_trait]
pub trait BuildRecordStore: Send + Sync {
    /// Append a record. Records are never updated afterwards.
    async fn append(&self, record: &BuildRecord) -> Result<()>;

    /// Up to `limit` well-formed records, most recent first, optionally
    /// restricted to a value of the stable flag.
    async fn list(&self, limit: usize, stable: Option<bool>) -> Result<Vec<BuildRecord>>;

    /// Most recent record for a commit hash
    async fn find_by_commit(&self, commit_hash: &str) -> Result<Option<BuildRecord>>;

    /// Most recent record, or most recent stable record
    async fn latest(&self, stable_only: bool) -> Result<Option<BuildRecord>> {
        let filter = stable_only.then_some(true);
        Ok(self.list(1, filter).await?.into_iter().next())
    }
}

/// Redis-backed record store.
///
/// Layout under the table namespace:
/// - `{table}:record:{millis}` hash of flat string fields, one per build
/// - `{table}:by_date` sorted set of record ids scored by publish millis
/// - `{table}:commit:{hash}` record id of the latest build for a commit
pub struct RedisRecordStore {
    conn: ConnectionManager,
    table: String,
    timeout: Duration,
}

impl RedisRecordStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str, table: &str, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .context("Timed out connecting to Redis")?
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {} (table {})", redis_url, table);

        Ok(Self {
            conn,
            table: table.to_string(),
            timeout,
        })
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:record:{}", self.table, id)
    }

    fn index_key(&self) -> String {
        format!("{}:by_date", self.table)
    }

    fn commit_key(&self, commit_hash: &str) -> String {
        format!("{}:commit:{}", self.table, commit_hash)
    }

    async fn load(&self, id: &str) -> Result<Option<BuildRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            bounded(self.timeout, conn.hgetall(self.record_key(id)))
                .await
                .map_err(BuildError::Storage)?;

        if fields.is_empty() {
            return Ok(None);
        }

        let record = record_from_fields(&fields);
        if record.is_none() {
            warn!("Skipping malformed build record {}", id);
        }
        Ok(record)
    }
}

#[async_trait]
impl BuildRecordStore for RedisRecordStore {
    async fn append(&self, record: &BuildRecord) -> Result<()> {
        let millis = record.date_published.timestamp_millis();
        let id = millis.to_string();
        let fields = record_to_fields(record);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.record_key(&id), &fields[..])
            .ignore()
            .zadd(self.index_key(), &id, millis)
            .ignore()
            .set(self.commit_key(record.commit_hash()), &id)
            .ignore();

        bounded(self.timeout, pipe.query_async::<_, ()>(&mut conn))
            .await
            .map_err(BuildError::RecordWriteFailed)?;

        info!(
            "Recorded build {} for commit {}",
            id,
            record.commit_hash()
        );
        Ok(())
    }

    async fn list(&self, limit: usize, stable: Option<bool>) -> Result<Vec<BuildRecord>> {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        let mut start: isize = 0;

        while found.len() < limit {
            let page = conn.zrevrange(self.index_key(), start, start + SCAN_PAGE - 1);
            let ids: Vec<String> = bounded(self.timeout, page)
                .await
                .map_err(BuildError::Storage)?;

            if ids.is_empty() {
                break;
            }
            start += SCAN_PAGE;

            for id in &ids {
                if let Some(record) = self.load(id).await? {
                    if record.matches_stable(stable) {
                        found.push(record);
                        if found.len() == limit {
                            break;
                        }
                    }
                }
            }
        }

        debug!("Listed {} build records (stable={:?})", found.len(), stable);
        Ok(found)
    }

    async fn find_by_commit(&self, commit_hash: &str) -> Result<Option<BuildRecord>> {
        let mut conn = self.conn.clone();
        let id: Option<String> =
            bounded(self.timeout, conn.get(self.commit_key(commit_hash)))
                .await
                .map_err(BuildError::Storage)?;

        match id {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }
}

/// Run a Redis call, failing once `timeout` elapses
async fn bounded<T, F>(timeout: Duration, call: F) -> std::result::Result<T, String>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("Redis call timed out after {:?}", timeout)),
    }
}

fn url_field(platform: Platform) -> String {
    format!("url_{}", platform)
}

fn record_to_fields(record: &BuildRecord) -> Vec<(String, String)> {
    let commit = &record.commit_info;
    let mut fields = vec![
        ("commit_hash".to_string(), commit.commit_hash.clone()),
        ("author".to_string(), commit.author.clone()),
        ("message".to_string(), commit.message.clone()),
        ("authored_date".to_string(), commit.authored_date.to_rfc3339()),
        ("date_published".to_string(), record.date_published.to_rfc3339()),
        ("notes".to_string(), record.notes.clone().unwrap_or_default()),
        (
            "stable".to_string(),
            record.stable.map(|s| s.to_string()).unwrap_or_default(),
        ),
    ];
    for platform in Platform::ALL {
        fields.push((url_field(platform), record.artifact_urls.get(platform).to_string()));
    }
    fields
}

/// Rebuild a typed record from its stored fields; `None` when malformed.
fn record_from_fields(fields: &HashMap<String, String>) -> Option<BuildRecord> {
    let text = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
    let date = |name: &str| {
        text(name)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    let urls = Platform::ALL
        .iter()
        .filter_map(|p| text(&url_field(*p)).map(|url| (*p, url)))
        .collect();

    Some(BuildRecord {
        commit_info: CommitInfo {
            commit_hash: text("commit_hash")?,
            author: text("author").unwrap_or_default(),
            message: text("message").unwrap_or_default(),
            authored_date: date("authored_date")?,
        },
        date_published: date("date_published")?,
        artifact_urls: ArtifactUrls::from_map(urls)?,
        notes: text("notes"),
        stable: text("stable").and_then(|s| s.parse().ok()),
    })
}
