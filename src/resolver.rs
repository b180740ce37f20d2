//! Topic resolution: raw topic string to canonical topic id.
//!
//! Exact slug lookup first; embedding-similarity clustering only on
//! slug-miss. Embedding failures never block resolution, they just
//! degrade identity to slug-only.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::embedding::{cosine_similarity, vec_to_blob, EmbeddingClient};
use crate::models::TopicStatus;
use crate::slug::{normalize_title, slugify};
use crate::store;

/// A near-duplicate topic surfaced during resolution.
#[derive(Debug, Clone)]
pub struct SimilarTopic {
    pub topic_id: String,
    pub slug: String,
    pub title: String,
    pub similarity: f32,
}

/// Result of resolving one raw topic string.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub topic_id: String,
    pub is_new_topic: bool,
    /// Candidates above the reporting threshold, best first. Populated
    /// only on the slug-miss path (clustering happens at write time).
    pub similar: Vec<SimilarTopic>,
}

/// Resolve a raw user-submitted topic to a canonical topic id, creating
/// a new CANDIDATE topic when nothing matches.
pub async fn resolve(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingClient,
    config: &EmbeddingConfig,
    raw_topic: &str,
) -> Result<Resolution> {
    let title = normalize_title(raw_topic);
    if title.is_empty() {
        bail!("Topic must not be empty");
    }
    let slug = slugify(&title);
    if slug.is_empty() {
        bail!("Topic '{}' normalizes to an empty slug", title);
    }

    // Fast path: exact slug hit
    if let Some(topic) = store::get_topic_by_slug(pool, &slug).await? {
        return Ok(Resolution {
            topic_id: topic.id,
            is_new_topic: false,
            similar: Vec::new(),
        });
    }

    // Slug miss: best-effort embedding for clustering
    let embedding = match embedder.embed(&title).await {
        Ok(vec) => Some(vec),
        Err(e) => {
            if config.is_enabled() {
                warn!(topic = %title, error = %e, "embedding failed, degrading to slug-only identity");
            }
            None
        }
    };

    let mut similar = Vec::new();
    if let Some(ref vec) = embedding {
        similar = find_similar_topics(
            pool,
            vec,
            config.candidate_threshold,
            config.candidate_limit,
        )
        .await?;

        if let Some(best) = similar.first() {
            if best.similarity >= config.cluster_threshold {
                return Ok(Resolution {
                    topic_id: best.topic_id.clone(),
                    is_new_topic: false,
                    similar,
                });
            }
        }
    }

    let topic_id = create_topic(pool, &slug, &title, embedding.as_deref()).await?;

    Ok(Resolution {
        topic_id,
        is_new_topic: true,
        similar,
    })
}

/// Nearest-neighbor lookup over all topics holding an embedding.
///
/// Full scan with cosine similarity computed in Rust; acceptable below
/// roughly ten thousand topics. An index-backed ANN search may replace
/// the body without changing this contract.
pub async fn find_similar_topics(
    pool: &SqlitePool,
    embedding: &[f32],
    threshold: f32,
    limit: usize,
) -> Result<Vec<SimilarTopic>> {
    let rows = sqlx::query(
        "SELECT id, slug, title, embedding FROM topics WHERE embedding IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<SimilarTopic> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = crate::embedding::blob_to_vec(&blob);
            let similarity = cosine_similarity(embedding, &vec);
            if similarity >= threshold {
                Some(SimilarTopic {
                    topic_id: row.get("id"),
                    slug: row.get("slug"),
                    title: row.get("title"),
                    similarity,
                })
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);

    Ok(candidates)
}

/// Insert a new CANDIDATE topic. Slug collisions from concurrent
/// resolvers fall back to the row that won the insert.
async fn create_topic(
    pool: &SqlitePool,
    slug: &str,
    title: &str,
    embedding: Option<&[f32]>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let blob = embedding.map(vec_to_blob);

    let result = sqlx::query(
        r#"
        INSERT INTO topics (id, slug, title, embedding, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(slug) DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(slug)
    .bind(title)
    .bind(&blob)
    .bind(TopicStatus::Candidate.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let existing: String = sqlx::query_scalar("SELECT id FROM topics WHERE slug = ?")
            .bind(slug)
            .fetch_one(pool)
            .await?;
        return Ok(existing);
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledClient;
    use crate::migrate;
    use async_trait::async_trait;
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

    /// Returns a fixed vector per matching keyword, errors otherwise.
    struct FixedEmbedder {
        vectors: Vec<(&'static str, Vec<f32>)>,
    }

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            for (needle, vec) in &self.vectors {
                if text.to_lowercase().contains(needle) {
                    return Ok(vec.clone());
                }
            }
            bail!("no fixture for '{}'", text)
        }
    }

    fn enabled_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".to_string(),
            model: Some("fixed".to_string()),
            dims: Some(3),
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_same_slug_resolves_to_same_topic() {
        let pool = test_pool().await;
        let config = EmbeddingConfig::default();

        let first = resolve(&pool, &DisabledClient, &config, "The Science of Sleep")
            .await
            .unwrap();
        assert!(first.is_new_topic);

        let second = resolve(&pool, &DisabledClient, &config, "  the SCIENCE of sleep!! ")
            .await
            .unwrap();
        assert!(!second.is_new_topic);
        assert_eq!(first.topic_id, second.topic_id);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_slug_only() {
        let pool = test_pool().await;
        let config = enabled_config();
        let embedder = FixedEmbedder { vectors: vec![] };

        // Every embed errors; resolution must still create the topic
        let res = resolve(&pool, &embedder, &config, "Quantum Entanglement")
            .await
            .unwrap();
        assert!(res.is_new_topic);

        let topic = store::get_topic(&pool, &res.topic_id).await.unwrap().unwrap();
        assert!(topic.embedding.is_none());
    }

    #[tokio::test]
    async fn test_similarity_clusters_near_duplicate() {
        let pool = test_pool().await;
        let config = enabled_config();
        let embedder = FixedEmbedder {
            vectors: vec![
                ("sleep science", vec![1.0, 0.0, 0.0]),
                // cosine vs [1,0,0] = 0.995, above the 0.92 threshold
                ("how sleeping works", vec![0.995, 0.0999, 0.0]),
            ],
        };

        let first = resolve(&pool, &embedder, &config, "Sleep Science Explained")
            .await
            .unwrap();
        assert!(first.is_new_topic);

        let second = resolve(&pool, &embedder, &config, "How Sleeping Works At Night")
            .await
            .unwrap();
        assert!(!second.is_new_topic);
        assert_eq!(second.topic_id, first.topic_id);
        assert!(!second.similar.is_empty());
        assert!(second.similar[0].similarity >= 0.92);
    }

    #[tokio::test]
    async fn test_dissimilar_topic_creates_new_cluster() {
        let pool = test_pool().await;
        let config = enabled_config();
        let embedder = FixedEmbedder {
            vectors: vec![
                ("sleep", vec![1.0, 0.0, 0.0]),
                ("volcano", vec![0.0, 1.0, 0.0]),
            ],
        };

        let first = resolve(&pool, &embedder, &config, "Sleep Cycles Deep Dive")
            .await
            .unwrap();
        let second = resolve(&pool, &embedder, &config, "Volcano Formation Basics")
            .await
            .unwrap();
        assert!(second.is_new_topic);
        assert_ne!(first.topic_id, second.topic_id);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let pool = test_pool().await;
        let config = EmbeddingConfig::default();
        assert!(resolve(&pool, &DisabledClient, &config, "   ").await.is_err());
    }

    #[tokio::test]
    async fn test_find_similar_respects_threshold_and_limit() {
        let pool = test_pool().await;

        for (i, vec) in [
            vec![1.0f32, 0.0, 0.0],
            vec![0.95, 0.3122, 0.0],
            vec![0.0, 1.0, 0.0],
        ]
        .iter()
        .enumerate()
        {
            create_topic(&pool, &format!("topic-{i}"), &format!("Topic {i}"), Some(vec))
                .await
                .unwrap();
        }

        let hits = find_similar_topics(&pool, &[1.0, 0.0, 0.0], 0.80, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].similarity >= hits[1].similarity);

        let capped = find_similar_topics(&pool, &[1.0, 0.0, 0.0], 0.80, 1)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }
}
