//! Scoring and promotion engine.
//!
//! Every pass refreshes the topic's quality aggregates and composite
//! score, so low-traffic topics carry visible, auditable scores long
//! before they qualify. Promotion itself is a strict conjunction of four
//! floors; each one contributes a human-readable reason or blocker.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::models::{JobStatus, TopicStatus};
use crate::store;

/// Outcome of one scoring pass over one topic.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub promoted: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub blockers: Vec<String>,
}

/// Structured summary returned by the batch entry point. Operators alert
/// on these counts; the shape is part of the contract.
#[derive(Debug, Default)]
pub struct ScoringBatchSummary {
    pub evaluated: u64,
    pub promoted: u64,
    pub failed: u64,
    pub errors: Vec<(String, String)>,
}

/// Median of completion fractions. Chosen over the mean to resist a
/// handful of zero- or full-completion outliers skewing the signal.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Composite desirability score in [0, 1].
///
/// The request and user terms are capped so one viral topic cannot
/// saturate its own ceiling disproportionately to the quality terms.
pub fn composite_score(
    config: &ScoringConfig,
    request_count: i64,
    unique_users: i64,
    completion_rate: f64,
    save_rate: f64,
) -> f64 {
    let request_term = (request_count as f64 / config.request_cap).min(1.0);
    let user_term = (unique_users as f64 / config.user_cap).min(1.0);
    0.30 * request_term + 0.25 * user_term + 0.25 * completion_rate + 0.20 * save_rate
}

/// Refresh a topic's aggregates and score, then promote it if every floor
/// holds. Idempotent on already-CANON topics (score refresh only, never a
/// second job).
pub async fn score_and_promote(
    pool: &SqlitePool,
    config: &ScoringConfig,
    topic_id: &str,
) -> Result<Promotion> {
    let topic = match store::get_topic(pool, topic_id).await? {
        Some(t) => t,
        None => bail!("Unknown topic: {}", topic_id),
    };

    // Step 1: refresh quality aggregates from the raw signal records
    let completions: Vec<f64> = sqlx::query_scalar(
        "SELECT completion_pct FROM content_requests \
         WHERE topic_id = ? AND completion_pct IS NOT NULL",
    )
    .bind(topic_id)
    .fetch_all(pool)
    .await?;

    let total_requests: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM content_requests WHERE topic_id = ?")
            .bind(topic_id)
            .fetch_one(pool)
            .await?;

    let saved_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM content_requests WHERE topic_id = ? AND saved = 1",
    )
    .bind(topic_id)
    .fetch_one(pool)
    .await?;

    let completion_rate = median(&completions);
    let save_rate = if total_requests > 0 {
        saved_count as f64 / total_requests as f64
    } else {
        0.0
    };

    // Step 2: composite score, persisted on every pass
    let score = composite_score(
        config,
        topic.request_count,
        topic.unique_users,
        completion_rate,
        save_rate,
    );

    sqlx::query(
        "UPDATE topics SET completion_rate = ?, save_rate = ?, canon_score = ? WHERE id = ?",
    )
    .bind(completion_rate)
    .bind(save_rate)
    .bind(score)
    .bind(topic_id)
    .execute(pool)
    .await?;

    // Step 3: strict conjunction of the four floors
    let mut reasons = Vec::new();
    let mut blockers = Vec::new();

    if topic.request_count >= config.min_requests {
        reasons.push(format!(
            "request volume {} meets floor {}",
            topic.request_count, config.min_requests
        ));
    } else {
        blockers.push(format!(
            "request volume {} below floor {}",
            topic.request_count, config.min_requests
        ));
    }
    if topic.unique_users >= config.min_unique_users {
        reasons.push(format!(
            "unique users {} meets floor {}",
            topic.unique_users, config.min_unique_users
        ));
    } else {
        blockers.push(format!(
            "unique users {} below floor {}",
            topic.unique_users, config.min_unique_users
        ));
    }
    if completion_rate >= config.min_completion_rate {
        reasons.push(format!(
            "completion rate {:.2} meets floor {:.2}",
            completion_rate, config.min_completion_rate
        ));
    } else {
        blockers.push(format!(
            "completion rate {:.2} below floor {:.2}",
            completion_rate, config.min_completion_rate
        ));
    }
    if score >= config.min_score {
        reasons.push(format!(
            "composite score {:.3} meets floor {:.2}",
            score, config.min_score
        ));
    } else {
        blockers.push(format!(
            "composite score {:.3} below floor {:.2}",
            score, config.min_score
        ));
    }

    // Step 4: lifecycle gates
    match topic.status {
        TopicStatus::Canon => {
            blockers.push("already canon; score refreshed only".to_string());
        }
        TopicStatus::Cold => {
            blockers.push("topic is cold; excluded from promotion".to_string());
        }
        TopicStatus::Candidate => {}
    }

    if !blockers.is_empty() {
        return Ok(Promotion {
            promoted: false,
            score,
            reasons,
            blockers,
        });
    }

    // Step 5: promote. Job creation, status flip, and the interim canon
    // pointer land in one transaction.
    let seed = store::latest_ready_personal_episode(pool, topic_id).await?;
    let now = chrono::Utc::now().timestamp();
    let job_id = Uuid::new_v4().to_string();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO canon_jobs (id, topic_id, seed_episode_id, status, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&job_id)
    .bind(topic_id)
    .bind(seed.as_ref().map(|e| e.id.clone()))
    .bind(JobStatus::Queued.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE topics SET status = ?, canon_promoted_at = ? WHERE id = ?")
        .bind(TopicStatus::Canon.as_str())
        .bind(now)
        .bind(topic_id)
        .execute(&mut *tx)
        .await?;

    if let Some(ref seed_ep) = seed {
        // Interim canon: serve the best personal episode until the
        // remaster lands
        sqlx::query("UPDATE episodes SET is_canon = 1 WHERE id = ?")
            .bind(&seed_ep.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE topics SET canon_episode_id = ? WHERE id = ?")
            .bind(&seed_ep.id)
            .bind(topic_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    info!(topic_id, job_id, score, "topic promoted to canon");
    reasons.push(format!("canon job {} queued", job_id));

    Ok(Promotion {
        promoted: true,
        score,
        reasons,
        blockers,
    })
}

/// Evaluate a bounded page of CANDIDATE topics, highest traffic first.
/// Per-topic failures are collected; one bad topic never aborts the run.
pub async fn run_scoring_batch(
    pool: &SqlitePool,
    config: &ScoringConfig,
    limit: Option<i64>,
) -> Result<ScoringBatchSummary> {
    let limit = limit.unwrap_or(config.batch_limit);

    let topic_ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM topics WHERE status = 'candidate' AND request_count >= ? \
         ORDER BY request_count DESC LIMIT ?",
    )
    .bind(config.min_requests)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut summary = ScoringBatchSummary::default();

    for topic_id in topic_ids {
        summary.evaluated += 1;
        match score_and_promote(pool, config, &topic_id).await {
            Ok(outcome) if outcome.promoted => summary.promoted += 1,
            Ok(_) => {}
            Err(e) => {
                warn!(topic_id = %topic_id, error = %e, "scoring failed for topic");
                summary.failed += 1;
                summary.errors.push((topic_id, e.to_string()));
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::RequestKind;
    use crate::signals::{self, EngagementPatch};
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
        sqlx::query("INSERT INTO topics (id, slug, title, created_at) VALUES (?, ?, ?, 0)")
            .bind(id)
            .bind(format!("slug-{id}"))
            .bind(format!("Topic {id}"))
            .execute(pool)
            .await
            .unwrap();
    }

    /// Record a request with engagement in one step.
    async fn engaged_request(
        pool: &SqlitePool,
        topic_id: &str,
        user: &str,
        completion: Option<f64>,
        saved: bool,
    ) {
        let episode_id = format!("ep-{}", Uuid::new_v4());
        signals::record(
            pool,
            topic_id,
            user,
            RequestKind::Candidate,
            false,
            None,
            Some(&episode_id),
        )
        .await
        .unwrap();
        signals::update_engagement(
            pool,
            &episode_id,
            user,
            EngagementPatch {
                completion_pct: completion,
                saved: if saved { Some(true) } else { None },
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_median_odd_even_empty() {
        assert_eq!(median(&[]), 0.0);
        assert!((median(&[0.9, 0.5, 0.7]) - 0.7).abs() < 1e-9);
        assert!((median(&[0.9, 0.8, 0.7, 0.5, 0.95]) - 0.8).abs() < 1e-9);
        assert!((median(&[0.4, 0.8]) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_median_resists_outliers() {
        // One zero and one perfect listen barely move the median
        assert!((median(&[0.0, 0.75, 0.8, 0.85, 1.0]) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_formula() {
        let config = ScoringConfig::default();
        // The documented worked example: 5 requests, 3 users, 0.8, 0.4
        let score = composite_score(&config, 5, 3, 0.8, 0.4);
        assert!((score - 0.3475).abs() < 1e-9);

        // 10 requests, 5 users, 0.75, 0.5
        let score = composite_score(&config, 10, 5, 0.75, 0.5);
        assert!((score - 0.41).abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_caps_viral_topics() {
        let config = ScoringConfig::default();
        let capped = composite_score(&config, 50_000, 20_000, 0.5, 0.5);
        let at_cap = composite_score(&config, 50, 20, 0.5, 0.5);
        assert!((capped - at_cap).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_score_refreshed_but_not_promoted_below_score_floor() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        // Five requests, three users, median 0.8, two saves: composite
        // 0.3475, below the 0.4 floor
        let listens = [
            ("alice", 0.9, true),
            ("alice", 0.8, false),
            ("bob", 0.7, true),
            ("bob", 0.5, false),
            ("carol", 0.95, false),
        ];
        for (user, pct, saved) in listens {
            engaged_request(&pool, "t1", user, Some(pct), saved).await;
        }

        let outcome = score_and_promote(&pool, &ScoringConfig::default(), "t1")
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!((outcome.score - 0.3475).abs() < 1e-9);
        assert_eq!(outcome.blockers.len(), 1);
        assert!(outcome.blockers[0].contains("composite score"));

        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert!((topic.canon_score - 0.3475).abs() < 1e-9);
        assert!((topic.completion_rate - 0.8).abs() < 1e-9);
        assert!((topic.save_rate - 0.4).abs() < 1e-9);
        assert_eq!(topic.status, TopicStatus::Candidate);
    }

    #[tokio::test]
    async fn test_promotion_when_all_floors_hold() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        // 10 requests from 5 users, median 0.75, half saved: score 0.41
        let users = ["u1", "u2", "u3", "u4", "u5"];
        for (i, user) in users.iter().cycle().take(10).enumerate() {
            engaged_request(&pool, "t1", user, Some(0.75), i % 2 == 0).await;
        }

        let outcome = score_and_promote(&pool, &ScoringConfig::default(), "t1")
            .await
            .unwrap();
        assert!(outcome.promoted, "blockers: {:?}", outcome.blockers);
        assert!((outcome.score - 0.41).abs() < 1e-9);
        assert!(outcome.blockers.is_empty());
        assert_eq!(outcome.reasons.len(), 5);

        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(topic.status, TopicStatus::Canon);
        assert!(topic.canon_promoted_at.is_some());

        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canon_jobs WHERE topic_id = 't1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(jobs, 1);
    }

    #[tokio::test]
    async fn test_repromotion_is_noop_refresh() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;
        let users = ["u1", "u2", "u3", "u4", "u5"];
        for (i, user) in users.iter().cycle().take(10).enumerate() {
            engaged_request(&pool, "t1", user, Some(0.75), i % 2 == 0).await;
        }

        let config = ScoringConfig::default();
        let first = score_and_promote(&pool, &config, "t1").await.unwrap();
        assert!(first.promoted);

        let second = score_and_promote(&pool, &config, "t1").await.unwrap();
        assert!(!second.promoted);
        assert!(second
            .blockers
            .iter()
            .any(|b| b.contains("already canon")));

        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canon_jobs WHERE topic_id = 't1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(jobs, 1, "re-promotion must not create a second job");
    }

    #[tokio::test]
    async fn test_single_failing_floor_blocks_promotion() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        // High volume and score, but only two distinct users
        for i in 0..20 {
            let user = if i % 2 == 0 { "u1" } else { "u2" };
            engaged_request(&pool, "t1", user, Some(0.9), true).await;
        }

        let outcome = score_and_promote(&pool, &ScoringConfig::default(), "t1")
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!(!outcome.blockers.is_empty());
        assert!(outcome.blockers.iter().any(|b| b.contains("unique users")));
    }

    #[tokio::test]
    async fn test_cold_topic_never_promoted() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;
        let users = ["u1", "u2", "u3", "u4", "u5"];
        for (i, user) in users.iter().cycle().take(10).enumerate() {
            engaged_request(&pool, "t1", user, Some(0.9), i % 2 == 0).await;
        }
        sqlx::query("UPDATE topics SET status = 'cold' WHERE id = 't1'")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = score_and_promote(&pool, &ScoringConfig::default(), "t1")
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!(outcome.blockers.iter().any(|b| b.contains("cold")));

        // Score is still refreshed for auditability
        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert!(topic.canon_score > 0.0);
    }

    #[tokio::test]
    async fn test_promotion_sets_interim_canon_from_seed() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;

        sqlx::query(
            "INSERT INTO episodes (id, topic_id, owner_id, title, transcript, status, created_at) \
             VALUES ('ep1', 't1', 'u1', 'Topic t1', 'script', 'ready', 10)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let users = ["u1", "u2", "u3", "u4", "u5"];
        for (i, user) in users.iter().cycle().take(10).enumerate() {
            engaged_request(&pool, "t1", user, Some(0.75), i % 2 == 0).await;
        }

        let outcome = score_and_promote(&pool, &ScoringConfig::default(), "t1")
            .await
            .unwrap();
        assert!(outcome.promoted);

        let topic = store::get_topic(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(topic.canon_episode_id.as_deref(), Some("ep1"));

        let episode = store::get_episode(&pool, "ep1").await.unwrap().unwrap();
        assert!(episode.is_canon);

        let seed: Option<String> =
            sqlx::query_scalar("SELECT seed_episode_id FROM canon_jobs WHERE topic_id = 't1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(seed.as_deref(), Some("ep1"));
    }

    #[tokio::test]
    async fn test_batch_isolates_per_topic_failures() {
        let pool = test_pool().await;
        for id in ["t1", "t2", "t3"] {
            seed_topic(&pool, id).await;
            let users = ["u1", "u2", "u3", "u4", "u5"];
            for (i, user) in users.iter().cycle().take(10).enumerate() {
                engaged_request(&pool, id, user, Some(0.75), i % 2 == 0).await;
            }
        }
        // Make one topic's score persist fail so its scoring pass errors
        sqlx::query(
            "CREATE TRIGGER break_t2 BEFORE UPDATE ON topics WHEN NEW.id = 't2' \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let summary = run_scoring_batch(&pool, &ScoringConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.evaluated, 3);
        assert_eq!(summary.promoted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].0, "t2");
    }

    #[tokio::test]
    async fn test_batch_skips_low_traffic_candidates() {
        let pool = test_pool().await;
        seed_topic(&pool, "t1").await;
        engaged_request(&pool, "t1", "u1", Some(0.9), true).await;

        let summary = run_scoring_batch(&pool, &ScoringConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.evaluated, 0);
    }
}
