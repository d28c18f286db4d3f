//! Content-addressed media storage.
//!
//! Normalized renditions are written once per distinct content hash under a
//! two-level sharded layout (`ab/cd/<hash>.jpg`), so duplicate uploads share
//! a single file and a hash maps to exactly one path. The [`MediaStore`]
//! trait is the seam between the engine and the filesystem.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;

/// Extension given to every normalized rendition.
pub const MEDIA_EXT: &str = "jpg";

/// Sharded path of a rendition relative to the media root.
pub fn rel_path(content_hash: &str) -> String {
    format!(
        "{}/{}/{}.{}",
        &content_hash[0..2],
        &content_hash[2..4],
        content_hash,
        MEDIA_EXT
    )
}

/// Where normalized image bytes live and how they are served.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Persist `bytes` under `content_hash` and return the serving URL.
    /// Saving the same hash again is a no-op yielding the same URL.
    async fn save(&self, content_hash: &str, bytes: &[u8]) -> Result<String>;

    /// Serving URL for a hash, whether or not it has been written yet.
    fn url_for(&self, content_hash: &str) -> String;

    /// Remove a stored rendition; hashes never written are ignored.
    async fn delete(&self, content_hash: &str) -> Result<()>;
}

/// Local filesystem media store.
pub struct LocalMediaStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalMediaStore {
    pub fn new(root: PathBuf, url_prefix: String) -> Self {
        Self { root, url_prefix }
    }

    fn path_for(&self, content_hash: &str) -> PathBuf {
        self.root.join(rel_path(content_hash))
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn save(&self, content_hash: &str, bytes: &[u8]) -> Result<String> {
        let target = self.path_for(content_hash);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if !target.exists() {
            fs::write(&target, bytes).await?;
        }
        Ok(self.url_for(content_hash))
    }

    fn url_for(&self, content_hash: &str) -> String {
        format!("{}/{}", self.url_prefix, rel_path(content_hash))
    }

    async fn delete(&self, content_hash: &str) -> Result<()> {
        match fs::remove_file(self.path_for(content_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
