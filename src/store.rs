//! SQLite-backed relational store for the thread → post → asset tree.
//!
//! All multi-row writes run inside one transaction: a post and its attached
//! assets either all commit or none do, so a partially-uploaded post is never
//! readable. Deletion is explicit and transactional (on top of the cascade
//! foreign keys) because callers need the removed asset rows back for
//! continuity-index maintenance.
//!
//! Row identifiers are UUIDv7 strings: time-ordered, collision-free under
//! creation bursts that wall-clock milliseconds cannot distinguish.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Asset, NewPost, NewThread, Post, PostDetail, Thread, ThreadDetail};
use crate::phash::PerceptualHash;

/// Asset fields ready for insertion, produced upstream by fingerprint
/// extraction and media storage.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub url: String,
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
    pub metadata_json: String,
}

/// Flattened asset → post → thread row, as consumed by the continuity
/// resolver when it turns index hits into chain occurrences.
#[derive(Debug, Clone)]
pub struct OccurrenceRow {
    pub asset_id: String,
    pub asset_url: String,
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
    pub post_id: String,
    pub post_created_at: i64,
    pub thread_id: String,
    pub thread_title: String,
    pub thread_created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ThreadStore {
    pool: SqlitePool,
}

impl ThreadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_thread(&self, new: &NewThread) -> Result<Thread, sqlx::Error> {
        let thread = Thread {
            id: Uuid::now_v7().to_string(),
            title: new.title.clone(),
            location: new.location.clone(),
            year: new.year,
            notes: new.notes.clone(),
            promoted: false,
            created_at: Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO threads (id, title, location, year, notes, promoted, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.title)
        .bind(&thread.location)
        .bind(thread.year)
        .bind(&thread.notes)
        .bind(thread.created_at)
        .execute(&self.pool)
        .await?;

        Ok(thread)
    }

    pub async fn get_thread(&self, id: &str) -> Result<Option<Thread>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, title, location, year, notes, promoted, created_at FROM threads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| thread_from_row(&r)))
    }

    /// All threads, newest first.
    pub async fn list_threads(&self) -> Result<Vec<Thread>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, title, location, year, notes, promoted, created_at FROM threads ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(thread_from_row).collect())
    }

    /// A thread with its posts (oldest first) and their assets.
    pub async fn thread_detail(&self, id: &str) -> Result<Option<ThreadDetail>, sqlx::Error> {
        let thread = match self.get_thread(id).await? {
            Some(t) => t,
            None => return Ok(None),
        };

        let post_rows = sqlx::query(
            "SELECT id, thread_id, author, body, created_at FROM posts WHERE thread_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut posts = Vec::with_capacity(post_rows.len());
        for row in &post_rows {
            let post = post_from_row(row);
            let asset_rows = sqlx::query(
                "SELECT id, post_id, url, content_hash, perceptual_hash, metadata_json, created_at FROM assets WHERE post_id = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(&post.id)
            .fetch_all(&self.pool)
            .await?;
            let assets = asset_rows.iter().map(asset_from_row).collect();
            posts.push(PostDetail { post, assets });
        }

        Ok(Some(ThreadDetail { thread, posts }))
    }

    /// Set the promoted flag. Idempotent; `false` means no such thread.
    pub async fn promote(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE threads SET promoted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a post and all of its assets in one transaction.
    /// `None` means the thread does not exist; nothing was written.
    pub async fn add_post(
        &self,
        thread_id: &str,
        new: &NewPost,
        assets: &[NewAsset],
    ) -> Result<Option<(Post, Vec<Asset>)>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let now = Utc::now().timestamp();
        let post = Post {
            id: Uuid::now_v7().to_string(),
            thread_id: thread_id.to_string(),
            author: new.author.clone(),
            body: new.body.clone(),
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO posts (id, thread_id, author, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&post.id)
        .bind(&post.thread_id)
        .bind(&post.author)
        .bind(&post.body)
        .bind(post.created_at)
        .execute(&mut *tx)
        .await?;

        let mut stored = Vec::with_capacity(assets.len());
        for asset in assets {
            stored.push(insert_asset(&mut tx, &post.id, asset, now).await?);
        }

        tx.commit().await?;
        Ok(Some((post, stored)))
    }

    /// Attach one asset to an existing post.
    /// `None` means the post does not exist; nothing was written.
    pub async fn add_asset(
        &self,
        post_id: &str,
        asset: &NewAsset,
    ) -> Result<Option<Asset>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let stored = insert_asset(&mut tx, post_id, asset, Utc::now().timestamp()).await?;
        tx.commit().await?;
        Ok(Some(stored))
    }

    /// Delete a thread and everything it owns, returning the removed assets
    /// so the caller can drop their index entries. `None` means no such
    /// thread; nothing was deleted.
    pub async fn delete_thread(&self, id: &str) -> Result<Option<Vec<Asset>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let asset_rows = sqlx::query(
            r#"
            SELECT a.id, a.post_id, a.url, a.content_hash, a.perceptual_hash, a.metadata_json, a.created_at
            FROM assets a
            JOIN posts p ON p.id = a.post_id
            WHERE p.thread_id = ?
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let removed: Vec<Asset> = asset_rows.iter().map(asset_from_row).collect();

        sqlx::query("DELETE FROM assets WHERE post_id IN (SELECT id FROM posts WHERE thread_id = ?)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posts WHERE thread_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(removed))
    }

    /// Live assets belonging to one thread.
    pub async fn assets_for_thread(&self, thread_id: &str) -> Result<Vec<Asset>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.post_id, a.url, a.content_hash, a.perceptual_hash, a.metadata_json, a.created_at
            FROM assets a
            JOIN posts p ON p.id = a.post_id
            WHERE p.thread_id = ?
            ORDER BY a.created_at ASC, a.id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(asset_from_row).collect())
    }

    /// Whether any live asset still references this content hash. Media
    /// files are shared between identical uploads, so the caller must check
    /// this before removing one.
    pub async fn content_hash_in_use(&self, content_hash: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM assets WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await
    }

    /// Every live asset; used to rebuild the continuity index at startup.
    pub async fn all_assets(&self) -> Result<Vec<Asset>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, post_id, url, content_hash, perceptual_hash, metadata_json, created_at FROM assets ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(asset_from_row).collect())
    }

    /// Flattened ownership rows for a set of asset ids, in chain-timeline
    /// order (owning thread's creation first, ids breaking ties).
    pub async fn occurrences_for_assets(
        &self,
        asset_ids: &[String],
    ) -> Result<Vec<OccurrenceRow>, sqlx::Error> {
        if asset_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; asset_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT a.id AS asset_id, a.url AS asset_url, a.content_hash, a.perceptual_hash,
                   p.id AS post_id, p.created_at AS post_created_at,
                   t.id AS thread_id, t.title AS thread_title, t.created_at AS thread_created_at
            FROM assets a
            JOIN posts p ON p.id = a.post_id
            JOIN threads t ON t.id = p.thread_id
            WHERE a.id IN ({})
            ORDER BY t.created_at ASC, t.id ASC, p.created_at ASC, p.id ASC, a.id ASC
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in asset_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| OccurrenceRow {
                asset_id: row.get("asset_id"),
                asset_url: row.get("asset_url"),
                content_hash: row.get("content_hash"),
                perceptual_hash: PerceptualHash(row.get::<i64, _>("perceptual_hash") as u64),
                post_id: row.get("post_id"),
                post_created_at: row.get("post_created_at"),
                thread_id: row.get("thread_id"),
                thread_title: row.get("thread_title"),
                thread_created_at: row.get("thread_created_at"),
            })
            .collect())
    }
}

async fn insert_asset(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    post_id: &str,
    asset: &NewAsset,
    created_at: i64,
) -> Result<Asset, sqlx::Error> {
    let stored = Asset {
        id: Uuid::now_v7().to_string(),
        post_id: post_id.to_string(),
        url: asset.url.clone(),
        content_hash: asset.content_hash.clone(),
        perceptual_hash: asset.perceptual_hash,
        metadata: serde_json::from_str(&asset.metadata_json).unwrap_or(serde_json::json!({})),
        created_at,
    };

    sqlx::query(
        r#"
        INSERT INTO assets (id, post_id, url, content_hash, perceptual_hash, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&stored.id)
    .bind(&stored.post_id)
    .bind(&stored.url)
    .bind(&stored.content_hash)
    .bind(stored.perceptual_hash.0 as i64)
    .bind(&asset.metadata_json)
    .bind(stored.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(stored)
}

fn thread_from_row(row: &SqliteRow) -> Thread {
    Thread {
        id: row.get("id"),
        title: row.get("title"),
        location: row.get("location"),
        year: row.get("year"),
        notes: row.get("notes"),
        promoted: row.get::<i64, _>("promoted") != 0,
        created_at: row.get("created_at"),
    }
}

fn post_from_row(row: &SqliteRow) -> Post {
    Post {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        author: row.get("author"),
        body: row.get("body"),
        created_at: row.get("created_at"),
    }
}

fn asset_from_row(row: &SqliteRow) -> Asset {
    let metadata_json: String = row.get("metadata_json");
    Asset {
        id: row.get("id"),
        post_id: row.get("post_id"),
        url: row.get("url"),
        content_hash: row.get("content_hash"),
        perceptual_hash: PerceptualHash(row.get::<i64, _>("perceptual_hash") as u64),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
    }
}
