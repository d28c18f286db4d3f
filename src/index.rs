//! Continuity index: fingerprint → live asset lookup.
//!
//! The [`ContinuityIndex`] trait defines the two probe modes the resolver
//! needs — exact lookup by content hash and bounded-distance search by
//! perceptual hash — plus the maintenance operations the engine performs on
//! upload and delete. The trait is the seam for swapping the scan strategy
//! (e.g. a BK-tree or LSH buckets) without touching callers.
//!
//! [`MemoryIndex`] is the default implementation: derived, rebuildable state
//! populated from a full asset scan at startup. At this system's corpus
//! scale a linear Hamming scan is comfortably fast, and the engine
//! serializes writers against readers, so the structure itself holds no
//! locks.

use std::collections::{BTreeSet, HashMap};

use crate::phash::PerceptualHash;

/// One indexed asset. Everything needed to answer probes without a store
/// round-trip.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub asset_id: String,
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
}

/// A bounded-distance probe hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearHit {
    pub asset_id: String,
    pub distance: u32,
}

/// Fingerprint lookup over the set of live assets.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](ContinuityIndex::insert) | Add (or refresh) one asset's fingerprints |
/// | [`remove`](ContinuityIndex::remove) | Drop assets after a cascade delete |
/// | [`exact_match`](ContinuityIndex::exact_match) | Equality lookup by content hash |
/// | [`near_match`](ContinuityIndex::near_match) | Hamming search by perceptual hash |
/// | [`contains`](ContinuityIndex::contains) | Membership check for consistency audits |
///
/// Implementations return deterministically ordered results so identical
/// state always produces identical chains.
pub trait ContinuityIndex: Send + Sync {
    /// Add one asset. Re-inserting an existing asset id replaces its entry.
    fn insert(&mut self, entry: IndexEntry);

    /// Remove the given asset ids; unknown ids are ignored.
    fn remove(&mut self, asset_ids: &[String]);

    /// Asset ids whose content hash equals `content_hash`, ascending.
    fn exact_match(&self, content_hash: &str) -> Vec<String>;

    /// Assets within `max_distance` bits of `hash` (inclusive), ordered by
    /// distance then asset id.
    fn near_match(&self, hash: PerceptualHash, max_distance: u32) -> Vec<NearHit>;

    /// Whether an asset id is currently indexed.
    fn contains(&self, asset_id: &str) -> bool;

    /// Number of indexed assets.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Linear-scan in-memory index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: HashMap<String, IndexEntry>,
    by_content: HashMap<String, BTreeSet<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContinuityIndex for MemoryIndex {
    fn insert(&mut self, entry: IndexEntry) {
        if let Some(old) = self.entries.remove(&entry.asset_id) {
            drop_from_bucket(&mut self.by_content, &old.content_hash, &old.asset_id);
        }
        self.by_content
            .entry(entry.content_hash.clone())
            .or_default()
            .insert(entry.asset_id.clone());
        self.entries.insert(entry.asset_id.clone(), entry);
    }

    fn remove(&mut self, asset_ids: &[String]) {
        for id in asset_ids {
            if let Some(old) = self.entries.remove(id) {
                drop_from_bucket(&mut self.by_content, &old.content_hash, id);
            }
        }
    }

    fn exact_match(&self, content_hash: &str) -> Vec<String> {
        self.by_content
            .get(content_hash)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn near_match(&self, hash: PerceptualHash, max_distance: u32) -> Vec<NearHit> {
        let mut hits: Vec<NearHit> = self
            .entries
            .values()
            .filter_map(|entry| {
                let distance = hash.distance(entry.perceptual_hash);
                (distance <= max_distance).then(|| NearHit {
                    asset_id: entry.asset_id.clone(),
                    distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.asset_id.cmp(&b.asset_id))
        });
        hits
    }

    fn contains(&self, asset_id: &str) -> bool {
        self.entries.contains_key(asset_id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn drop_from_bucket(
    buckets: &mut HashMap<String, BTreeSet<String>>,
    content_hash: &str,
    asset_id: &str,
) {
    if let Some(bucket) = buckets.get_mut(content_hash) {
        bucket.remove(asset_id);
        if bucket.is_empty() {
            buckets.remove(content_hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, content: &str, phash: u64) -> IndexEntry {
        IndexEntry {
            asset_id: id.to_string(),
            content_hash: content.to_string(),
            perceptual_hash: PerceptualHash(phash),
        }
    }

    #[test]
    fn exact_match_groups_by_content_hash() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("a1", "h1", 0));
        idx.insert(entry("a2", "h1", 1));
        idx.insert(entry("a3", "h2", 2));
        assert_eq!(idx.exact_match("h1"), vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(idx.exact_match("h2"), vec!["a3".to_string()]);
        assert!(idx.exact_match("missing").is_empty());
    }

    #[test]
    fn near_match_is_inclusive_and_ordered() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("far", "h1", 0b1111_1111));
        idx.insert(entry("close", "h2", 0b0000_0001));
        idx.insert(entry("same", "h3", 0b0000_0000));
        let hits = idx.near_match(PerceptualHash(0), 1);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].asset_id, "same");
        assert_eq!(hits[0].distance, 0);
        assert_eq!(hits[1].asset_id, "close");
        assert_eq!(hits[1].distance, 1);
    }

    #[test]
    fn near_match_boundary_is_included() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("a", "h", 0b0111));
        assert_eq!(idx.near_match(PerceptualHash(0), 3).len(), 1);
        assert!(idx.near_match(PerceptualHash(0), 2).is_empty());
    }

    #[test]
    fn remove_clears_both_probe_paths() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("a1", "h1", 5));
        idx.insert(entry("a2", "h1", 5));
        idx.remove(&["a1".to_string()]);
        assert!(!idx.contains("a1"));
        assert_eq!(idx.exact_match("h1"), vec!["a2".to_string()]);
        idx.remove(&["a2".to_string()]);
        assert!(idx.exact_match("h1").is_empty());
        assert!(idx.near_match(PerceptualHash(5), 0).is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn remove_unknown_id_is_a_no_op() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("a1", "h1", 5));
        idx.remove(&["ghost".to_string()]);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn reinsert_replaces_the_old_entry() {
        let mut idx = MemoryIndex::new();
        idx.insert(entry("a1", "h1", 5));
        idx.insert(entry("a1", "h2", 9));
        assert_eq!(idx.len(), 1);
        assert!(idx.exact_match("h1").is_empty());
        assert_eq!(idx.exact_match("h2"), vec!["a1".to_string()]);
        assert_eq!(idx.near_match(PerceptualHash(9), 0).len(), 1);
    }
}
