use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source revision as reported by the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub commit_hash: String,
    pub author: String,
    pub message: String,
    pub authored_date: DateTime<Utc>,
}

impl CommitInfo {
    /// Same revision, regardless of the descriptive fields.
    pub fn same_revision(&self, other: &CommitInfo) -> bool {
        self.commit_hash == other.commit_hash
    }
}

/// Commit hashes accepted on the wire: 4 to 64 hex digits.
///
/// Hashes end up in cache paths and object keys, so this also keeps
/// separators and `..` out of them.
pub fn is_valid_commit_hash(hash: &str) -> bool {
    (4..=64).contains(&hash.len()) && hash.chars().all(|c| c.is_ascii_hexdigit())
}
