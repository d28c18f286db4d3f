//! Engine: the single entry point tying the relational store, the media
//! store, and the continuity index together.
//!
//! The engine owns the consistency discipline between store and index:
//! mutations take the index write lock around the database commit, and
//! continuity queries hold the read lock across their probes. A reader can
//! therefore never observe an asset in one structure and not the other;
//! when a resolve does find skew, that is corruption and surfaces as
//! [`EngineError::IndexInconsistency`]. The index itself is derived state,
//! rebuilt from a full asset scan at open.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::continuity;
use crate::db;
use crate::fingerprint::{self, ExtractError};
use crate::index::{ContinuityIndex, IndexEntry, MemoryIndex, NearHit};
use crate::media::{LocalMediaStore, MediaStore};
use crate::migrate;
use crate::models::{
    Asset, ContinuityReport, NewPost, NewThread, Post, Thread, ThreadDetail,
};
use crate::phash::PerceptualHash;
use crate::store::{NewAsset, ThreadStore};

/// Every failure an engine operation can surface.
#[derive(Debug)]
pub enum EngineError {
    /// Decodable image in a format the engine does not accept.
    UnsupportedFormat(String),
    /// Undecodable, truncated, or oversized image input.
    CorruptImage(String),
    ThreadNotFound(String),
    PostNotFound(String),
    /// Transient store failure. Nothing was committed; the whole logical
    /// operation may be retried.
    StoreUnavailable(String),
    /// Store and index disagree. Fatal invariant violation; the affected
    /// query fails loudly instead of returning an incomplete chain.
    IndexInconsistency(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnsupportedFormat(m) => write!(f, "unsupported image format: {}", m),
            EngineError::CorruptImage(m) => write!(f, "corrupt image: {}", m),
            EngineError::ThreadNotFound(id) => write!(f, "thread not found: {}", id),
            EngineError::PostNotFound(id) => write!(f, "post not found: {}", id),
            EngineError::StoreUnavailable(m) => write!(f, "store unavailable: {}", m),
            EngineError::IndexInconsistency(m) => {
                write!(f, "continuity index inconsistent: {}", m)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ExtractError> for EngineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::UnsupportedFormat(m) => EngineError::UnsupportedFormat(m),
            ExtractError::CorruptImage(m) => EngineError::CorruptImage(m),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}

pub struct Engine {
    store: ThreadStore,
    media: Arc<dyn MediaStore>,
    index: RwLock<Box<dyn ContinuityIndex>>,
    max_dimension: u32,
    jpeg_quality: u8,
    max_distance: u32,
}

impl Engine {
    /// Open the database (applying migrations), attach the media root, and
    /// rebuild the continuity index from the live assets.
    pub async fn open(config: &Config) -> anyhow::Result<Engine> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let media: Arc<dyn MediaStore> = Arc::new(LocalMediaStore::new(
            config.media.root.clone(),
            config.media.url_prefix.clone(),
        ));

        let engine = Engine {
            store: ThreadStore::new(pool),
            media,
            index: RwLock::new(Box::new(MemoryIndex::new())),
            max_dimension: config.fingerprint.max_dimension,
            jpeg_quality: config.fingerprint.jpeg_quality,
            max_distance: config.matching.max_distance,
        };
        engine.rebuild_index().await?;
        Ok(engine)
    }

    /// Rebuild the index from a full store scan, replacing whatever it
    /// currently holds. Returns the number of indexed assets.
    pub async fn rebuild_index(&self) -> anyhow::Result<usize> {
        let assets = self.store.all_assets().await?;
        let mut fresh = MemoryIndex::new();
        for asset in &assets {
            fresh.insert(IndexEntry {
                asset_id: asset.id.clone(),
                content_hash: asset.content_hash.clone(),
                perceptual_hash: asset.perceptual_hash,
            });
        }
        let count = fresh.len();
        *self.index.write().await = Box::new(fresh);
        Ok(count)
    }

    /// Configured default near-match threshold.
    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }

    pub async fn create_thread(&self, new: &NewThread) -> Result<Thread, EngineError> {
        Ok(self.store.create_thread(new).await?)
    }

    /// All threads, newest first.
    pub async fn list_threads(&self) -> Result<Vec<Thread>, EngineError> {
        Ok(self.store.list_threads().await?)
    }

    /// A thread with its posts and their assets.
    pub async fn get_thread(&self, id: &str) -> Result<ThreadDetail, EngineError> {
        self.store
            .thread_detail(id)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound(id.to_string()))
    }

    /// Mark a thread as curated. Idempotent.
    pub async fn promote(&self, id: &str) -> Result<(), EngineError> {
        if self.store.promote(id).await? {
            Ok(())
        } else {
            Err(EngineError::ThreadNotFound(id.to_string()))
        }
    }

    /// Fingerprint `images`, store their renditions, and commit the post
    /// with all of its assets atomically. Any bad image fails the whole
    /// upload before a single row is written.
    pub async fn add_post(
        &self,
        thread_id: &str,
        new: &NewPost,
        images: &[Vec<u8>],
    ) -> Result<(Post, Vec<Asset>), EngineError> {
        let new_assets = self.prepare_assets(images).await?;

        // Commit and index insert move together under the write lock, so a
        // concurrent resolve never sees one without the other.
        let mut index = self.index.write().await;
        let (post, assets) = self
            .store
            .add_post(thread_id, new, &new_assets)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))?;
        for asset in &assets {
            index.insert(IndexEntry {
                asset_id: asset.id.clone(),
                content_hash: asset.content_hash.clone(),
                perceptual_hash: asset.perceptual_hash,
            });
        }
        Ok((post, assets))
    }

    /// Fingerprint one image and attach it to an existing post.
    pub async fn add_asset(&self, post_id: &str, image: &[u8]) -> Result<Asset, EngineError> {
        let images = [image.to_vec()];
        let new_assets = self.prepare_assets(&images).await?;

        let mut index = self.index.write().await;
        let asset = self
            .store
            .add_asset(post_id, &new_assets[0])
            .await?
            .ok_or_else(|| EngineError::PostNotFound(post_id.to_string()))?;
        index.insert(IndexEntry {
            asset_id: asset.id.clone(),
            content_hash: asset.content_hash.clone(),
            perceptual_hash: asset.perceptual_hash,
        });
        Ok(asset)
    }

    /// Delete a thread and everything it owns. Index entries go away under
    /// the same write lock as the database delete, so a removed asset can
    /// never surface in a later chain. Returns the number of assets removed.
    pub async fn delete_thread(&self, id: &str) -> Result<usize, EngineError> {
        let mut index = self.index.write().await;
        let removed = self
            .store
            .delete_thread(id)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound(id.to_string()))?;
        let ids: Vec<String> = removed.iter().map(|a| a.id.clone()).collect();
        index.remove(&ids);
        drop(index);

        // Best-effort media cleanup. Renditions still referenced by other
        // threads' assets stay; a failed unlink only leaves an orphan file
        // for `verify` to report.
        let hashes: BTreeSet<&str> = removed.iter().map(|a| a.content_hash.as_str()).collect();
        for hash in hashes {
            if let Ok(false) = self.store.content_hash_in_use(hash).await {
                let _ = self.media.delete(hash).await;
            }
        }

        Ok(ids.len())
    }

    /// Cross-thread continuity chains for a thread's assets.
    pub async fn continuity(
        &self,
        thread_id: &str,
        max_distance: Option<u32>,
    ) -> Result<ContinuityReport, EngineError> {
        let thread = self
            .store
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))?;

        let index = self.index.read().await;
        continuity::resolve(
            &self.store,
            &**index,
            &thread.id,
            max_distance.unwrap_or(self.max_distance),
        )
        .await
    }

    /// Equality probe into the live index; exposed for integrity checks
    /// and tests.
    pub async fn exact_match(&self, content_hash: &str) -> Vec<String> {
        self.index.read().await.exact_match(content_hash)
    }

    /// Bounded-distance probe into the live index.
    pub async fn near_match(&self, hash: PerceptualHash, max_distance: u32) -> Vec<NearHit> {
        self.index.read().await.near_match(hash, max_distance)
    }

    /// Number of assets currently indexed.
    pub async fn indexed_assets(&self) -> usize {
        self.index.read().await.len()
    }

    /// Extract fingerprints for a batch and persist their renditions.
    /// Extraction happens for every image before any filesystem write.
    async fn prepare_assets(&self, images: &[Vec<u8>]) -> Result<Vec<NewAsset>, EngineError> {
        let mut prints = Vec::with_capacity(images.len());
        for raw in images {
            prints.push(fingerprint::extract(
                raw,
                self.max_dimension,
                self.jpeg_quality,
            )?);
        }

        let mut new_assets = Vec::with_capacity(prints.len());
        for fp in &prints {
            let url = self
                .media
                .save(&fp.content_hash, &fp.normalized)
                .await
                .map_err(|e| EngineError::StoreUnavailable(format!("media store: {}", e)))?;
            let metadata_json =
                serde_json::to_string(&fp.metadata).unwrap_or_else(|_| "{}".to_string());
            new_assets.push(NewAsset {
                url,
                content_hash: fp.content_hash.clone(),
                perceptual_hash: fp.perceptual_hash,
                metadata_json,
            });
        }
        Ok(new_assets)
    }
}
