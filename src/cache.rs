//! Cache read path.
//!
//! A hit requires three things at once: the slug resolves to a CANON
//! topic, the topic carries a canon episode pointer, and the pointed-at
//! episode is READY. Anything less is a miss and the caller falls through
//! to generation.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Episode, EpisodeStatus, RequestKind, Topic, TopicStatus};
use crate::signals;
use crate::slug::{normalize_title, slugify};
use crate::store;

#[derive(Debug)]
pub struct CacheHit {
    pub topic: Topic,
    pub episode: Episode,
}

/// Look up the canon artifact for a raw topic string. Read-only; records
/// nothing.
pub async fn check_cache(pool: &SqlitePool, raw_topic: &str) -> Result<Option<CacheHit>> {
    let title = normalize_title(raw_topic);
    let slug = slugify(&title);
    if slug.is_empty() {
        return Ok(None);
    }

    let topic = match store::get_topic_by_slug(pool, &slug).await? {
        Some(t) => t,
        None => return Ok(None),
    };
    if topic.status != TopicStatus::Canon {
        return Ok(None);
    }

    let episode_id = match &topic.canon_episode_id {
        Some(id) => id.clone(),
        None => {
            debug!(topic_id = %topic.id, "canon topic has no episode pointer yet");
            return Ok(None);
        }
    };

    let episode = match store::get_episode(pool, &episode_id).await? {
        Some(e) if e.status == EpisodeStatus::Ready => e,
        _ => {
            debug!(topic_id = %topic.id, episode_id, "canon pointer does not resolve to a ready episode");
            return Ok(None);
        }
    };

    Ok(Some(CacheHit { topic, episode }))
}

/// Serve a cache hit to a requester: copy the canon artifact into a
/// zero-cost episode they own and record the request as a hit. Returns
/// `None` on a miss.
pub async fn serve_from_cache(
    pool: &SqlitePool,
    raw_topic: &str,
    requester_id: &str,
) -> Result<Option<Episode>> {
    let hit = match check_cache(pool, raw_topic).await? {
        Some(hit) => hit,
        None => return Ok(None),
    };

    let clone = clone_episode(pool, &hit.episode, requester_id).await?;

    signals::record(
        pool,
        &hit.topic.id,
        requester_id,
        RequestKind::Candidate,
        true,
        Some(0.0),
        Some(&clone.id),
    )
    .await?;

    debug!(topic_id = %hit.topic.id, episode_id = %clone.id, "served from canon cache");
    Ok(Some(clone))
}

/// Copy a canon episode into a requester-owned one. The copy shares the
/// transcript and audio pointer; it is not itself canon and costs nothing.
pub async fn clone_episode(
    pool: &SqlitePool,
    source: &Episode,
    owner_id: &str,
) -> Result<Episode> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO episodes (id, topic_id, owner_id, title, transcript, audio_url, status, \
         is_canon, cost, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
    )
    .bind(&id)
    .bind(&source.topic_id)
    .bind(owner_id)
    .bind(&source.title)
    .bind(&source.transcript)
    .bind(&source.audio_url)
    .bind(EpisodeStatus::Ready.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Episode {
        id,
        topic_id: source.topic_id.clone(),
        owner_id: owner_id.to_string(),
        title: source.title.clone(),
        transcript: source.transcript.clone(),
        audio_url: source.audio_url.clone(),
        status: EpisodeStatus::Ready,
        is_canon: false,
        cost: 0.0,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn seed_canon(pool: &SqlitePool, slug: &str, episode_status: &str) {
        sqlx::query(
            "INSERT INTO topics (id, slug, title, status, canon_episode_id, created_at) \
             VALUES ('t1', ?, 'The Science of Sleep', 'canon', 'ep1', 0)",
        )
        .bind(slug)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO episodes (id, topic_id, owner_id, title, transcript, audio_url, status, \
             is_canon, cost, created_at) \
             VALUES ('ep1', 't1', 'canon', 'The Science of Sleep', 'script', 'http://m/ep1.mp3', ?, 1, 0.4, 0)",
        )
        .bind(episode_status)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hit_requires_canon_pointer_and_ready_episode() {
        let pool = test_pool().await;
        seed_canon(&pool, "the-science-of-sleep", "ready").await;

        // Title variants normalize to the same slug
        let hit = check_cache(&pool, "  The SCIENCE of Sleep!! ").await.unwrap();
        assert!(hit.is_some());
        let hit = hit.unwrap();
        assert_eq!(hit.episode.id, "ep1");
        assert_eq!(hit.topic.slug, "the-science-of-sleep");
    }

    #[tokio::test]
    async fn test_miss_on_unknown_slug() {
        let pool = test_pool().await;
        assert!(check_cache(&pool, "Volcano Formation").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_on_candidate_topic() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO topics (id, slug, title, status, created_at) \
             VALUES ('t1', 'the-science-of-sleep', 'The Science of Sleep', 'candidate', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(check_cache(&pool, "The Science of Sleep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_on_missing_pointer() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO topics (id, slug, title, status, created_at) \
             VALUES ('t1', 'the-science-of-sleep', 'The Science of Sleep', 'canon', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(check_cache(&pool, "The Science of Sleep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_on_unready_episode() {
        let pool = test_pool().await;
        seed_canon(&pool, "the-science-of-sleep", "pending").await;
        assert!(check_cache(&pool, "The Science of Sleep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_serve_clones_and_records_hit() {
        let pool = test_pool().await;
        seed_canon(&pool, "the-science-of-sleep", "ready").await;

        let clone = serve_from_cache(&pool, "The Science of Sleep", "alice")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(clone.id, "ep1");
        assert_eq!(clone.owner_id, "alice");
        assert_eq!(clone.transcript, "script");
        assert_eq!(clone.audio_url.as_deref(), Some("http://m/ep1.mp3"));
        assert!(!clone.is_canon);
        assert_eq!(clone.cost, 0.0);

        // The hit still feeds the topic's usage signals
        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(topic.request_count, 1);
        assert_eq!(topic.unique_users, 1);

        let hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM content_requests WHERE cache_hit = 1 AND cost = 0",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn test_canon_original_is_never_handed_out() {
        let pool = test_pool().await;
        seed_canon(&pool, "the-science-of-sleep", "ready").await;

        serve_from_cache(&pool, "The Science of Sleep", "alice")
            .await
            .unwrap()
            .unwrap();

        let canon = store::get_episode(&pool, "ep1").await.unwrap().unwrap();
        assert_eq!(canon.owner_id, "canon");
        assert!(canon.is_canon);
    }
}
