//! Integrity sweep across the store and the media root.
//!
//! Re-derives everything that should be derivable: every asset row must
//! have its rendition on disk, the rendition's bytes must still hash to
//! the stored content hash and decode to a picture the stored perceptual
//! hash still describes, every ownership edge must resolve, and files
//! under the media root should belong to at least one live asset. Damage
//! fails the run with a non-zero exit; orphan files are reported but
//! tolerated because an interrupted delete legitimately leaves them
//! behind.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::media;
use crate::phash::{self, PerceptualHash};

/// Run the verify command: sweep the database and media root, print a
/// summary, and fail if anything is damaged.
pub async fn run_verify(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let thread_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads")
        .fetch_one(&pool)
        .await?;
    let post_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(&pool)
        .await?;
    let asset_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets")
        .fetch_one(&pool)
        .await?;

    println!("Reprise — Integrity Sweep");
    println!("=========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Media root:   {}", config.media.root.display());
    println!();
    println!("  Threads:      {}", thread_count);
    println!("  Posts:        {}", post_count);
    println!("  Assets:       {}", asset_count);
    println!();

    // Ownership edges the cascade makes impossible unless the database was
    // modified out-of-band.
    let dangling_posts: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM posts p LEFT JOIN threads t ON t.id = p.thread_id WHERE t.id IS NULL",
    )
    .fetch_one(&pool)
    .await?;
    let dangling_assets: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assets a LEFT JOIN posts p ON p.id = a.post_id WHERE p.id IS NULL",
    )
    .fetch_one(&pool)
    .await?;
    if dangling_posts > 0 {
        println!("  DANGLING  {} post(s) without a thread", dangling_posts);
    }
    if dangling_assets > 0 {
        println!("  DANGLING  {} asset(s) without a post", dangling_assets);
    }

    // Rendition sweep: every referenced content hash must name a file on
    // disk whose bytes still hash to the stored value, and each row's
    // perceptual hash must still describe the picture those bytes decode
    // to. Rows are grouped per hash so a shared rendition is read once.
    let rows: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT id, content_hash, perceptual_hash FROM assets ORDER BY id ASC")
            .fetch_all(&pool)
            .await?;
    let mut by_hash: BTreeMap<String, Vec<(String, PerceptualHash)>> = BTreeMap::new();
    for (id, hash, bits) in rows {
        by_hash
            .entry(hash)
            .or_default()
            .push((id, PerceptualHash(bits as u64)));
    }

    let mut ok = 0usize;
    let mut missing = 0usize;
    let mut corrupt = 0usize;
    let mut malformed = 0usize;
    let mut fp_ok = 0usize;
    let mut drifted = 0usize;
    let mut claimed: HashSet<String> = HashSet::new();
    for (hash, rows) in &by_hash {
        // A value that is not a SHA-256 digest cannot name a rendition;
        // report the rows instead of deriving a path from it.
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            malformed += 1;
            println!("  MALFORMED {:?} on {} asset(s)", hash, rows.len());
            continue;
        }
        let rel = media::rel_path(hash);
        claimed.insert(rel.clone());
        let path = config.media.root.join(&rel);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                missing += 1;
                println!("  MISSING   {}", rel);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != *hash {
            corrupt += 1;
            println!("  CORRUPT   {} (bytes hash to {})", rel, actual);
            continue;
        }
        ok += 1;

        // The stored hash comes from the pre-encode pixels, so the JPEG
        // round trip may move it a few bits. Past the match radius the
        // row can no longer find its own picture.
        match image::load_from_memory(&bytes) {
            Ok(img) => {
                let derived = phash::hash_image(&img);
                for (asset_id, stored) in rows {
                    let d = stored.distance(derived);
                    if d > config.matching.max_distance {
                        drifted += 1;
                        println!(
                            "  DRIFT     asset {} (stored {}, rendition {}, d={})",
                            asset_id, stored, derived, d
                        );
                    } else {
                        fp_ok += 1;
                    }
                }
            }
            Err(e) => {
                drifted += rows.len();
                println!("  DRIFT     {} (rendition does not decode: {})", rel, e);
            }
        }
    }

    // Files nothing references. Tolerated but reported.
    let mut orphan_files = 0usize;
    if config.media.root.is_dir() {
        for entry in WalkDir::new(&config.media.root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&config.media.root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if !claimed.contains(&rel) {
                orphan_files += 1;
                println!("  ORPHAN    {}", rel);
            }
        }
    }

    println!();
    println!(
        "  Renditions:   {} ok, {} missing, {} corrupt",
        ok, missing, corrupt
    );
    println!("  Fingerprints: {} ok, {} drifted", fp_ok, drifted);
    println!("  Orphans:      {}", orphan_files);
    println!();

    pool.close().await;

    let damage =
        missing + corrupt + malformed + drifted + (dangling_posts + dangling_assets) as usize;
    if damage > 0 {
        anyhow::bail!("integrity sweep found {} problem(s)", damage);
    }

    println!("  OK — no damage found");
    Ok(())
}
