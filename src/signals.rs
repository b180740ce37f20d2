//! Usage signal recording.
//!
//! One immutable request record per fulfillment, with the owning topic's
//! denormalized counters recomputed in the same transaction. `unique_users`
//! is an exact distinct count, not an approximation, because it gates
//! promotion.

use anyhow::{bail, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{RequestKind, RequestRecord};

/// Partial engagement update. Only fields that are `Some` are applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngagementPatch {
    /// Fraction listened, clamped to [0, 1] before storage. Callers may
    /// report out-of-range values (e.g. a replay pushing it above 1.0);
    /// the clamp is the documented correction policy.
    pub completion_pct: Option<f64>,
    pub saved: Option<bool>,
    pub replayed: Option<bool>,
}

impl EngagementPatch {
    pub fn is_empty(&self) -> bool {
        self.completion_pct.is_none() && self.saved.is_none() && self.replayed.is_none()
    }
}

/// Record one content request and refresh the topic's aggregate counters.
pub async fn record(
    pool: &SqlitePool,
    topic_id: &str,
    requester_id: &str,
    kind: RequestKind,
    cache_hit: bool,
    cost: Option<f64>,
    episode_id: Option<&str>,
) -> Result<RequestRecord> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM topics WHERE id = ?")
        .bind(topic_id)
        .fetch_one(pool)
        .await?;
    if !exists {
        bail!("Unknown topic: {}", topic_id);
    }

    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO content_requests (id, topic_id, requester_id, kind, cache_hit, cost, episode_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(topic_id)
    .bind(requester_id)
    .bind(kind.as_str())
    .bind(cache_hit as i64)
    .bind(cost)
    .bind(episode_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // Counter refresh keyed by topic id, atomic with the insert
    sqlx::query(
        r#"
        UPDATE topics SET
            request_count = request_count + 1,
            unique_users = (
                SELECT COUNT(DISTINCT requester_id) FROM content_requests WHERE topic_id = ?
            )
        WHERE id = ?
        "#,
    )
    .bind(topic_id)
    .bind(topic_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(RequestRecord {
        id,
        topic_id: topic_id.to_string(),
        requester_id: requester_id.to_string(),
        kind,
        cache_hit,
        cost,
        episode_id: episode_id.map(|s| s.to_string()),
        completion_pct: None,
        saved: None,
        replayed: None,
        created_at: now,
    })
}

/// Apply a post-hoc engagement update to the most recent request this
/// requester made for this episode. Returns `None` when no matching
/// record exists or the patch carries no fields.
pub async fn update_engagement(
    pool: &SqlitePool,
    episode_id: &str,
    requester_id: &str,
    patch: EngagementPatch,
) -> Result<Option<RequestRecord>> {
    if patch.is_empty() {
        return Ok(None);
    }

    let row = sqlx::query(
        r#"
        SELECT id FROM content_requests
        WHERE episode_id = ? AND requester_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(episode_id)
    .bind(requester_id)
    .fetch_optional(pool)
    .await?;

    let request_id: String = match row {
        Some(r) => r.get("id"),
        None => return Ok(None),
    };

    if let Some(pct) = patch.completion_pct {
        let clamped = pct.clamp(0.0, 1.0);
        sqlx::query("UPDATE content_requests SET completion_pct = ? WHERE id = ?")
            .bind(clamped)
            .bind(&request_id)
            .execute(pool)
            .await?;
    }
    if let Some(saved) = patch.saved {
        sqlx::query("UPDATE content_requests SET saved = ? WHERE id = ?")
            .bind(saved as i64)
            .bind(&request_id)
            .execute(pool)
            .await?;
    }
    if let Some(replayed) = patch.replayed {
        sqlx::query("UPDATE content_requests SET replayed = ? WHERE id = ?")
            .bind(replayed as i64)
            .bind(&request_id)
            .execute(pool)
            .await?;
    }

    let row = sqlx::query(
        "SELECT id, topic_id, requester_id, kind, cache_hit, cost, episode_id, \
         completion_pct, saved, replayed, created_at FROM content_requests WHERE id = ?",
    )
    .bind(&request_id)
    .fetch_one(pool)
    .await?;

    Ok(Some(request_from_row(&row)?))
}

pub(crate) fn request_from_row(row: &SqliteRow) -> Result<RequestRecord> {
    let kind: String = row.get("kind");
    let cache_hit: i64 = row.get("cache_hit");
    let saved: Option<i64> = row.get("saved");
    let replayed: Option<i64> = row.get("replayed");
    Ok(RequestRecord {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        requester_id: row.get("requester_id"),
        kind: RequestKind::parse(&kind)?,
        cache_hit: cache_hit != 0,
        cost: row.get("cost"),
        episode_id: row.get("episode_id"),
        completion_pct: row.get("completion_pct"),
        saved: saved.map(|v| v != 0),
        replayed: replayed.map(|v| v != 0),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::store;
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

    async fn seed_topic(pool: &SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO topics (id, slug, title, created_at) VALUES (?, ?, ?, 0)",
        )
        .bind(id)
        .bind(format!("slug-{id}"))
        .bind(format!("Topic {id}"))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_updates_counters_exactly() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        record(&pool, "t1", "alice", RequestKind::Candidate, false, None, None)
            .await
            .unwrap();
        record(&pool, "t1", "alice", RequestKind::Candidate, true, None, None)
            .await
            .unwrap();
        record(&pool, "t1", "bob", RequestKind::Candidate, false, Some(0.12), None)
            .await
            .unwrap();

        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(topic.request_count, 3);
        assert_eq!(topic.unique_users, 2);
    }

    #[tokio::test]
    async fn test_record_unknown_topic_rejected() {
        let pool = test_pool().await;
        let result = record(&pool, "nope", "alice", RequestKind::Personal, false, None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_engagement_clamps_completion() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;
        record(&pool, "t1", "alice", RequestKind::Candidate, false, None, Some("ep1"))
            .await
            .unwrap();

        let updated = update_engagement(
            &pool,
            "ep1",
            "alice",
            EngagementPatch {
                completion_pct: Some(5.0),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.completion_pct, Some(1.0));

        let updated = update_engagement(
            &pool,
            "ep1",
            "alice",
            EngagementPatch {
                completion_pct: Some(-3.0),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.completion_pct, Some(0.0));
    }

    #[tokio::test]
    async fn test_engagement_partial_patch_preserves_other_fields() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;
        record(&pool, "t1", "alice", RequestKind::Candidate, false, None, Some("ep1"))
            .await
            .unwrap();

        update_engagement(
            &pool,
            "ep1",
            "alice",
            EngagementPatch {
                completion_pct: Some(0.8),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated = update_engagement(
            &pool,
            "ep1",
            "alice",
            EngagementPatch {
                saved: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.completion_pct, Some(0.8));
        assert_eq!(updated.saved, Some(true));
        assert_eq!(updated.replayed, None);
    }

    #[tokio::test]
    async fn test_engagement_no_match_or_empty_patch_is_noop() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        let none = update_engagement(
            &pool,
            "ep-missing",
            "alice",
            EngagementPatch {
                saved: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(none.is_none());

        record(&pool, "t1", "alice", RequestKind::Candidate, false, None, Some("ep1"))
            .await
            .unwrap();
        let none = update_engagement(&pool, "ep1", "alice", EngagementPatch::default())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_engagement_targets_most_recent_request() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        let first = record(&pool, "t1", "alice", RequestKind::Candidate, false, None, Some("ep1"))
            .await
            .unwrap();
        let second = record(&pool, "t1", "alice", RequestKind::Candidate, true, None, Some("ep1"))
            .await
            .unwrap();

        // Pin distinct timestamps so recency is unambiguous
        sqlx::query("UPDATE content_requests SET created_at = 100 WHERE id = ?")
            .bind(&first.id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE content_requests SET created_at = 200 WHERE id = ?")
            .bind(&second.id)
            .execute(&pool)
            .await
            .unwrap();

        let updated = update_engagement(
            &pool,
            "ep1",
            "alice",
            EngagementPatch {
                replayed: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.id, second.id);
        assert_eq!(updated.replayed, Some(true));
    }
}
