//! Core data models for the continuity engine.
//!
//! Threads own posts, posts own assets — a strict three-level tree. These
//! types flow between the store, the continuity resolver, the HTTP surface,
//! and the CLI. Identifiers are UUIDv7 strings: time-ordered, safe under
//! sub-millisecond creation bursts.

use serde::{Deserialize, Serialize};

use crate::phash::PerceptualHash;

/// A named discussion unit. Owns zero or more posts; mutated only to flip
/// `promoted`.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub location: Option<String>,
    pub year: Option<i32>,
    pub notes: Option<String>,
    pub promoted: bool,
    /// Unix seconds.
    pub created_at: i64,
}

/// Fields accepted when creating a thread.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewThread {
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One contribution within a thread. Owns zero or more assets; immutable
/// after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub id: String,
    pub thread_id: String,
    pub author: String,
    pub body: String,
    pub created_at: i64,
}

/// Fields accepted when adding a post.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPost {
    pub author: String,
    #[serde(default)]
    pub body: String,
}

/// One stored image bound to a post. Immutable; destroyed only by cascade.
#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub id: String,
    pub post_id: String,
    /// Serving path of the normalized rendition.
    pub url: String,
    /// SHA-256 hex of the normalized bytes; equality means byte-identical.
    pub content_hash: String,
    /// 64-bit perceptual fingerprint; small Hamming distance means
    /// visually similar.
    pub perceptual_hash: PerceptualHash,
    /// Open EXIF-derived key → value mapping; may be empty.
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// A thread with its full post/asset tree, posts oldest-first.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    pub posts: Vec<PostDetail>,
}

/// One post with its attached assets.
#[derive(Debug, Clone, Serialize)]
pub struct PostDetail {
    pub post: Post,
    pub assets: Vec<Asset>,
}

/// How an occurrence matched the source fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Near,
}

/// One sighting of a matching asset in another thread.
#[derive(Debug, Clone, Serialize)]
pub struct Occurrence {
    pub thread_id: String,
    pub thread_title: String,
    /// Unix seconds; occurrences in a chain are non-decreasing in this.
    pub thread_created_at: i64,
    pub post_id: String,
    pub asset_id: String,
    pub asset_url: String,
    pub match_kind: MatchKind,
    /// Hamming distance to the source fingerprint; 0 for exact matches.
    pub distance: u32,
}

/// All cross-thread sightings produced by one of the queried thread's
/// fingerprints, ordered oldest thread first. Chains never include the
/// queried thread's own assets.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuityChain {
    /// The source content hash when any occurrence matched exactly,
    /// otherwise the source perceptual hash in hex.
    pub matched_hash: String,
    /// Perceptual fingerprint the chain was probed with.
    pub perceptual_hash: PerceptualHash,
    pub occurrences: Vec<Occurrence>,
}

/// Continuity query result for one thread.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuityReport {
    pub thread_id: String,
    /// Distinct fingerprints probed (content hashes plus perceptual hashes).
    pub fingerprints_checked: usize,
    pub chains: Vec<ContinuityChain>,
}
