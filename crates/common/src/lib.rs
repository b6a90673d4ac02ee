pub mod commit;
pub mod error;
pub mod record;

pub use commit::{is_valid_commit_hash, CommitInfo};
pub use error::{BuildError, Result};
pub use record::{ArtifactUrls, BuildRecord, Platform};
