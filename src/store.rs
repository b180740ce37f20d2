//! Shared row mappers and single-entity fetches.
//!
//! Component modules own their domain-specific queries; the lookups that
//! several of them need (topic by id or slug, episode by id, newest ready
//! episode) live here so the row-to-struct mapping exists once.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::blob_to_vec;
use crate::models::{Episode, EpisodeStatus, Topic, TopicStatus};

pub(crate) fn topic_from_row(row: &SqliteRow) -> Result<Topic> {
    let status: String = row.get("status");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(Topic {
        id: row.get("id"),
        slug: row.get("slug"),
        title: row.get("title"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        status: TopicStatus::parse(&status)?,
        request_count: row.get("request_count"),
        unique_users: row.get("unique_users"),
        completion_rate: row.get("completion_rate"),
        save_rate: row.get("save_rate"),
        canon_score: row.get("canon_score"),
        canon_episode_id: row.get("canon_episode_id"),
        canon_promoted_at: row.get("canon_promoted_at"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn episode_from_row(row: &SqliteRow) -> Result<Episode> {
    let status: String = row.get("status");
    let is_canon: i64 = row.get("is_canon");
    Ok(Episode {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        transcript: row.get("transcript"),
        audio_url: row.get("audio_url"),
        status: EpisodeStatus::parse(&status)?,
        is_canon: is_canon != 0,
        cost: row.get("cost"),
        created_at: row.get("created_at"),
    })
}

const TOPIC_COLUMNS: &str = "id, slug, title, embedding, status, request_count, unique_users, \
                             completion_rate, save_rate, canon_score, canon_episode_id, \
                             canon_promoted_at, created_at";

const EPISODE_COLUMNS: &str =
    "id, topic_id, owner_id, title, transcript, audio_url, status, is_canon, cost, created_at";

pub async fn get_topic(pool: &SqlitePool, id: &str) -> Result<Option<Topic>> {
    let row = sqlx::query(&format!("SELECT {} FROM topics WHERE id = ?", TOPIC_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| topic_from_row(&r)).transpose()
}

pub async fn get_topic_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Topic>> {
    let row = sqlx::query(&format!("SELECT {} FROM topics WHERE slug = ?", TOPIC_COLUMNS))
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    row.map(|r| topic_from_row(&r)).transpose()
}

pub async fn get_episode(pool: &SqlitePool, id: &str) -> Result<Option<Episode>> {
    let row = sqlx::query(&format!("SELECT {} FROM episodes WHERE id = ?", EPISODE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| episode_from_row(&r)).transpose()
}

/// Newest READY episode for a topic, the remaster seed of last resort.
pub async fn latest_ready_episode(pool: &SqlitePool, topic_id: &str) -> Result<Option<Episode>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM episodes WHERE topic_id = ? AND status = 'ready' \
         ORDER BY created_at DESC, id DESC LIMIT 1",
        EPISODE_COLUMNS
    ))
    .bind(topic_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| episode_from_row(&r)).transpose()
}

/// Newest READY personal (non-canon) episode, used as the promotion seed.
pub async fn latest_ready_personal_episode(
    pool: &SqlitePool,
    topic_id: &str,
) -> Result<Option<Episode>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM episodes WHERE topic_id = ? AND status = 'ready' AND is_canon = 0 \
         ORDER BY created_at DESC, id DESC LIMIT 1",
        EPISODE_COLUMNS
    ))
    .bind(topic_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| episode_from_row(&r)).transpose()
}
