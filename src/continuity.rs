//! Continuity resolution: find every other thread carrying the same or a
//! visually near-identical asset.
//!
//! The resolver is a pure read. It probes the index once per distinct
//! source fingerprint, unions the hits, drops everything owned by the
//! queried thread, and enriches the remainder from the store in a single
//! query. Chains are grouped per source perceptual hash and occurrences
//! inside a chain run oldest thread first. Skew between index and store
//! fails the resolve instead of silently shortening a chain.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::engine::EngineError;
use crate::index::ContinuityIndex;
use crate::models::{ContinuityChain, ContinuityReport, MatchKind, Occurrence};
use crate::phash::PerceptualHash;
use crate::store::ThreadStore;

/// External sightings gathered for one source perceptual hash before the
/// store enrichment pass.
struct Probe<'a> {
    phash: PerceptualHash,
    /// Matched asset id, best known distance.
    distances: BTreeMap<String, u32>,
    /// Subset of `distances` that matched on content hash.
    exact_ids: BTreeSet<String>,
    /// Source content hashes that produced at least one exact hit.
    exact_hashes: BTreeSet<&'a str>,
}

/// Build the continuity report for `thread_id`. The caller is expected to
/// have verified the thread exists and to hold whatever lock makes the
/// index and store a consistent pair.
pub async fn resolve(
    store: &ThreadStore,
    index: &dyn ContinuityIndex,
    thread_id: &str,
    max_distance: u32,
) -> Result<ContinuityReport, EngineError> {
    let own = store.assets_for_thread(thread_id).await?;

    // Every live asset must be indexed. A miss means a mutation reached the
    // store without its index insert, and any chain we produced now could be
    // missing members.
    for asset in &own {
        if !index.contains(&asset.id) {
            return Err(EngineError::IndexInconsistency(format!(
                "asset {} (content hash {}) is live but not indexed",
                asset.id, asset.content_hash
            )));
        }
    }

    let own_ids: HashSet<&str> = own.iter().map(|a| a.id.as_str()).collect();

    // Cluster the thread's assets by perceptual hash. Each cluster is
    // probed once and becomes at most one chain.
    let mut clusters: BTreeMap<PerceptualHash, BTreeSet<&str>> = BTreeMap::new();
    let mut fingerprints: BTreeSet<(&str, PerceptualHash)> = BTreeSet::new();
    for asset in &own {
        clusters
            .entry(asset.perceptual_hash)
            .or_default()
            .insert(asset.content_hash.as_str());
        fingerprints.insert((asset.content_hash.as_str(), asset.perceptual_hash));
    }
    let fingerprints_checked = fingerprints.len();

    // Near probe once per perceptual hash, exact probe once per distinct
    // content hash under it. An asset hit both ways counts as exact.
    let mut probes: Vec<Probe> = Vec::with_capacity(clusters.len());
    let mut wanted: BTreeSet<String> = BTreeSet::new();
    for (phash, content_hashes) in &clusters {
        let mut probe = Probe {
            phash: *phash,
            distances: BTreeMap::new(),
            exact_ids: BTreeSet::new(),
            exact_hashes: BTreeSet::new(),
        };
        for hit in index.near_match(*phash, max_distance) {
            if own_ids.contains(hit.asset_id.as_str()) {
                continue;
            }
            probe.distances.insert(hit.asset_id, hit.distance);
        }
        for &content_hash in content_hashes {
            for id in index.exact_match(content_hash) {
                if own_ids.contains(id.as_str()) {
                    continue;
                }
                probe.distances.entry(id.clone()).or_insert(0);
                probe.exact_ids.insert(id);
                probe.exact_hashes.insert(content_hash);
            }
        }
        wanted.extend(probe.distances.keys().cloned());
        probes.push(probe);
    }

    // One store round-trip covers every matched asset and returns rows in
    // final occurrence order: owning thread age, then post age, ids
    // breaking ties.
    let ids: Vec<String> = wanted.into_iter().collect();
    let rows = store.occurrences_for_assets(&ids).await?;
    if rows.len() != ids.len() {
        let found: HashSet<&str> = rows.iter().map(|r| r.asset_id.as_str()).collect();
        let missing: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !found.contains(*id))
            .collect();
        return Err(EngineError::IndexInconsistency(format!(
            "index entries with no live asset: {}",
            missing.join(", ")
        )));
    }

    let mut chains = Vec::new();
    for probe in &probes {
        if probe.distances.is_empty() {
            continue;
        }
        let occurrences: Vec<Occurrence> = rows
            .iter()
            .filter(|row| probe.distances.contains_key(&row.asset_id))
            .map(|row| {
                let exact = probe.exact_ids.contains(&row.asset_id);
                Occurrence {
                    thread_id: row.thread_id.clone(),
                    thread_title: row.thread_title.clone(),
                    thread_created_at: row.thread_created_at,
                    post_id: row.post_id.clone(),
                    asset_id: row.asset_id.clone(),
                    asset_url: row.asset_url.clone(),
                    match_kind: if exact { MatchKind::Exact } else { MatchKind::Near },
                    distance: if exact {
                        0
                    } else {
                        probe.distances.get(&row.asset_id).copied().unwrap_or(0)
                    },
                }
            })
            .collect();

        // Label the chain with a content hash when anything matched
        // exactly (smallest wins for determinism), otherwise with the
        // perceptual hash itself.
        let matched_hash = match probe.exact_hashes.iter().next() {
            Some(h) => (*h).to_string(),
            None => probe.phash.to_string(),
        };
        chains.push(ContinuityChain {
            matched_hash,
            perceptual_hash: probe.phash,
            occurrences,
        });
    }
    chains.sort_by(|a, b| a.matched_hash.cmp(&b.matched_hash));

    Ok(ContinuityReport {
        thread_id: thread_id.to_string(),
        fingerprints_checked,
        chains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::index::{IndexEntry, MemoryIndex};
    use crate::migrate;
    use crate::models::NewPost;
    use crate::store::NewAsset;

    async fn open_store(dir: &TempDir) -> ThreadStore {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("continuity.db"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        ThreadStore::new(pool)
    }

    /// Insert a thread row directly so tests control `created_at`.
    async fn seed_thread(store: &ThreadStore, title: &str, created_at: i64) -> String {
        let id = Uuid::now_v7().to_string();
        sqlx::query("INSERT INTO threads (id, title, promoted, created_at) VALUES (?, ?, 0, ?)")
            .bind(&id)
            .bind(title)
            .bind(created_at)
            .execute(store.pool())
            .await
            .unwrap();
        id
    }

    /// Add a one-asset post with fixed hashes, mirrored into the index.
    async fn seed_asset(
        store: &ThreadStore,
        index: &mut MemoryIndex,
        thread_id: &str,
        content_hash: &str,
        phash: u64,
    ) -> String {
        let asset = NewAsset {
            url: format!("/media/{}.jpg", content_hash),
            content_hash: content_hash.to_string(),
            perceptual_hash: PerceptualHash(phash),
            metadata_json: "{}".to_string(),
        };
        let new_post = NewPost {
            author: "seed".to_string(),
            body: String::new(),
        };
        let (_, assets) = store
            .add_post(thread_id, &new_post, &[asset])
            .await
            .unwrap()
            .unwrap();
        let id = assets[0].id.clone();
        index.insert(IndexEntry {
            asset_id: id.clone(),
            content_hash: content_hash.to_string(),
            perceptual_hash: PerceptualHash(phash),
        });
        id
    }

    #[tokio::test]
    async fn empty_thread_yields_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.thread_id, a);
        assert_eq!(report.fingerprints_checked, 0);
        assert!(report.chains.is_empty());
    }

    #[tokio::test]
    async fn own_duplicates_do_not_form_chains() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff00).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff00).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.fingerprints_checked, 1);
        assert!(report.chains.is_empty());
    }

    #[tokio::test]
    async fn exact_occurrence_in_another_thread() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let b = seed_thread(&store, "beta", 200).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff00).await;
        let b_asset = seed_asset(&store, &mut index, &b, "aaaa", 0xff00).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.chains.len(), 1);

        let chain = &report.chains[0];
        assert_eq!(chain.matched_hash, "aaaa");
        assert_eq!(chain.perceptual_hash, PerceptualHash(0xff00));
        assert_eq!(chain.occurrences.len(), 1);

        let occ = &chain.occurrences[0];
        assert_eq!(occ.asset_id, b_asset);
        assert_eq!(occ.thread_id, b);
        assert_eq!(occ.thread_title, "beta");
        assert_eq!(occ.match_kind, MatchKind::Exact);
        assert_eq!(occ.distance, 0);
    }

    #[tokio::test]
    async fn near_occurrence_carries_distance() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let b = seed_thread(&store, "beta", 200).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0b1111).await;
        seed_asset(&store, &mut index, &b, "bbbb", 0b1000).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.chains.len(), 1);

        let chain = &report.chains[0];
        assert_eq!(chain.matched_hash, PerceptualHash(0b1111).to_string());
        assert_eq!(chain.occurrences.len(), 1);
        assert_eq!(chain.occurrences[0].match_kind, MatchKind::Near);
        assert_eq!(chain.occurrences[0].distance, 3);
    }

    #[tokio::test]
    async fn matches_outside_the_radius_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let b = seed_thread(&store, "beta", 200).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0).await;
        seed_asset(&store, &mut index, &b, "bbbb", u64::MAX).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert!(report.chains.is_empty());
    }

    #[tokio::test]
    async fn exact_and_near_hits_share_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let b = seed_thread(&store, "beta", 200).await;
        let c = seed_thread(&store, "gamma", 300).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0b1111).await;
        let exact = seed_asset(&store, &mut index, &b, "aaaa", 0b1111).await;
        let near = seed_asset(&store, &mut index, &c, "cccc", 0b1110).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.chains.len(), 1);

        let chain = &report.chains[0];
        assert_eq!(chain.matched_hash, "aaaa");
        assert_eq!(chain.occurrences.len(), 2);
        assert_eq!(chain.occurrences[0].asset_id, exact);
        assert_eq!(chain.occurrences[0].match_kind, MatchKind::Exact);
        assert_eq!(chain.occurrences[0].distance, 0);
        assert_eq!(chain.occurrences[1].asset_id, near);
        assert_eq!(chain.occurrences[1].match_kind, MatchKind::Near);
        assert_eq!(chain.occurrences[1].distance, 1);
    }

    #[tokio::test]
    async fn occurrences_run_oldest_thread_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 500).await;
        let b = seed_thread(&store, "beta", 300).await;
        let c = seed_thread(&store, "gamma", 100).await;
        let d = seed_thread(&store, "delta", 200).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff).await;
        seed_asset(&store, &mut index, &b, "aaaa", 0xff).await;
        seed_asset(&store, &mut index, &c, "aaaa", 0xff).await;
        seed_asset(&store, &mut index, &d, "aaaa", 0xff).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        assert_eq!(report.chains.len(), 1);

        let chain = &report.chains[0];
        let stamps: Vec<i64> = chain
            .occurrences
            .iter()
            .map(|o| o.thread_created_at)
            .collect();
        assert_eq!(stamps, vec![100, 200, 300]);

        let titles: Vec<&str> = chain
            .occurrences
            .iter()
            .map(|o| o.thread_title.as_str())
            .collect();
        assert_eq!(titles, vec!["gamma", "delta", "beta"]);
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        // UUIDv7 ids generated in sequence sort in creation order, which
        // keeps the timeline honest when creation times collide.
        let a = seed_thread(&store, "alpha", 500).await;
        let first = seed_thread(&store, "first", 100).await;
        let second = seed_thread(&store, "second", 100).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff).await;
        seed_asset(&store, &mut index, &first, "aaaa", 0xff).await;
        seed_asset(&store, &mut index, &second, "aaaa", 0xff).await;

        let report = resolve(&store, &index, &a, 10).await.unwrap();
        let order: Vec<&str> = report.chains[0]
            .occurrences
            .iter()
            .map(|o| o.thread_id.as_str())
            .collect();
        assert_eq!(order, vec![first.as_str(), second.as_str()]);
    }

    #[tokio::test]
    async fn live_asset_missing_from_index_is_inconsistency() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        let asset = NewAsset {
            url: "/media/aaaa.jpg".to_string(),
            content_hash: "aaaa".to_string(),
            perceptual_hash: PerceptualHash(0xff),
            metadata_json: "{}".to_string(),
        };
        let new_post = NewPost {
            author: "seed".to_string(),
            body: String::new(),
        };
        store
            .add_post(&a, &new_post, &[asset])
            .await
            .unwrap()
            .unwrap();

        let err = resolve(&store, &index, &a, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::IndexInconsistency(_)), "{err}");
    }

    #[tokio::test]
    async fn dangling_index_entry_is_inconsistency() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut index = MemoryIndex::new();

        let a = seed_thread(&store, "alpha", 100).await;
        seed_asset(&store, &mut index, &a, "aaaa", 0xff).await;
        index.insert(IndexEntry {
            asset_id: "ghost".to_string(),
            content_hash: "aaaa".to_string(),
            perceptual_hash: PerceptualHash(0xff),
        });

        let err = resolve(&store, &index, &a, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::IndexInconsistency(_)), "{err}");
    }
}
