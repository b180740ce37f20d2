//! The full request path: cache first, generation on miss.
//!
//! This is the seam the CLI drives. A hit costs nothing and is served as
//! a clone of the canon artifact; a miss resolves the topic, runs the
//! personal pipeline, and records the spend against the topic's signals.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::audio::AudioStage;
use crate::cache;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::llm::LlmBackend;
use crate::models::{Episode, EpisodeStatus, RequestKind};
use crate::pipeline::{GenerationPipeline, PipelineMode};
use crate::resolver;
use crate::signals;
use crate::store;

#[derive(Debug)]
pub enum RequestOutcome {
    /// Served from the canon cache at zero cost.
    Hit(Episode),
    /// Freshly generated for this requester.
    Generated(Episode),
}

impl RequestOutcome {
    pub fn episode(&self) -> &Episode {
        match self {
            RequestOutcome::Hit(e) | RequestOutcome::Generated(e) => e,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, RequestOutcome::Hit(_))
    }
}

pub struct RequestService<'a> {
    pool: &'a SqlitePool,
    config: &'a Config,
    embedder: &'a dyn EmbeddingClient,
    primary: &'a dyn LlmBackend,
    secondary: &'a dyn LlmBackend,
    audio: &'a AudioStage,
}

impl<'a> RequestService<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        config: &'a Config,
        embedder: &'a dyn EmbeddingClient,
        primary: &'a dyn LlmBackend,
        secondary: &'a dyn LlmBackend,
        audio: &'a AudioStage,
    ) -> Self {
        Self {
            pool,
            config,
            embedder,
            primary,
            secondary,
            audio,
        }
    }

    /// Serve one request end to end. `personal` marks the request as a
    /// customized variant that carries no promotion pressure.
    pub async fn handle(
        &self,
        raw_topic: &str,
        requester_id: &str,
        personal: bool,
    ) -> Result<RequestOutcome> {
        if !personal {
            if let Some(episode) = cache::serve_from_cache(self.pool, raw_topic, requester_id)
                .await
                .context("cache lookup failed")?
            {
                return Ok(RequestOutcome::Hit(episode));
            }
        }

        let resolution =
            resolver::resolve(self.pool, self.embedder, &self.config.embedding, raw_topic).await?;
        let topic = store::get_topic(self.pool, &resolution.topic_id)
            .await?
            .context("resolved topic disappeared")?;

        let pipeline = GenerationPipeline::new(self.primary, self.secondary, &self.config.pipeline);
        let run = pipeline
            .run(&topic.title, None, PipelineMode::Personal)
            .await
            .with_context(|| format!("generation failed for '{}'", topic.title))?;
        let cost = run.llm_calls as f64 * self.config.pipeline.cost_per_call;

        let episode_id = Uuid::new_v4().to_string();
        let audio_url = self
            .audio
            .produce(&episode_id, &run.transcript)
            .await
            .context("audio synthesis failed")?;

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO episodes (id, topic_id, owner_id, title, transcript, audio_url, status, \
             is_canon, cost, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&episode_id)
        .bind(&topic.id)
        .bind(requester_id)
        .bind(&topic.title)
        .bind(&run.transcript)
        .bind(&audio_url)
        .bind(EpisodeStatus::Ready.as_str())
        .bind(cost)
        .bind(now)
        .execute(self.pool)
        .await?;

        let kind = if personal {
            RequestKind::Personal
        } else {
            RequestKind::Candidate
        };
        signals::record(
            self.pool,
            &topic.id,
            requester_id,
            kind,
            false,
            Some(cost),
            Some(&episode_id),
        )
        .await?;

        info!(topic_id = %topic.id, episode_id = %episode_id, cost, "generated new episode");

        let episode = store::get_episode(self.pool, &episode_id)
            .await?
            .context("episode missing after insert")?;
        Ok(RequestOutcome::Generated(episode))
    }
}
