use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Every statement is idempotent; running this on an
/// existing database is safe.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            embedding BLOB,
            status TEXT NOT NULL DEFAULT 'candidate',
            request_count INTEGER NOT NULL DEFAULT 0,
            unique_users INTEGER NOT NULL DEFAULT 0,
            completion_rate REAL NOT NULL DEFAULT 0,
            save_rate REAL NOT NULL DEFAULT 0,
            canon_score REAL NOT NULL DEFAULT 0,
            canon_episode_id TEXT,
            canon_promoted_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_requests (
            id TEXT PRIMARY KEY,
            topic_id TEXT NOT NULL,
            requester_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            cache_hit INTEGER NOT NULL DEFAULT 0,
            cost REAL,
            episode_id TEXT,
            completion_pct REAL,
            saved INTEGER,
            replayed INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (topic_id) REFERENCES topics(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canon_jobs (
            id TEXT PRIMARY KEY,
            topic_id TEXT NOT NULL,
            seed_episode_id TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            error TEXT,
            episode_id TEXT,
            cost REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            FOREIGN KEY (topic_id) REFERENCES topics(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            id TEXT PRIMARY KEY,
            topic_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            transcript TEXT NOT NULL,
            audio_url TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            is_canon INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (topic_id) REFERENCES topics(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_status ON topics(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_topics_request_count ON topics(request_count DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_topic_id ON content_requests(topic_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_episode ON content_requests(episode_id, requester_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON canon_jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_episodes_topic ON episodes(topic_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
