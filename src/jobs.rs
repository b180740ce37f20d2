//! Canon job orchestration.
//!
//! Jobs move QUEUED → RUNNING → SUCCEEDED | FAILED and never backward.
//! The batch runner processes claims strictly one at a time; sequential
//! execution is the rate-limiting policy toward the model providers, not
//! an implementation shortcut.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::AudioStage;
use crate::config::{JobsConfig, PipelineConfig};
use crate::llm::LlmBackend;
use crate::models::{CanonJob, EpisodeStatus, JobStatus};
use crate::pipeline::{GenerationPipeline, PipelineMode};
use crate::store;

/// Owner recorded on canon episodes; they belong to the cache, not to the
/// user whose request triggered promotion.
pub const CANON_OWNER: &str = "canon";

/// Terminal record of one processed job.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub episode_id: Option<String>,
    pub error: Option<String>,
    pub cost: f64,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct JobBatchSummary {
    pub requeued_stale: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

fn job_from_row(row: &SqliteRow) -> Result<CanonJob> {
    let status: String = row.get("status");
    Ok(CanonJob {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        seed_episode_id: row.get("seed_episode_id"),
        status: JobStatus::parse(&status)?,
        error: row.get("error"),
        episode_id: row.get("episode_id"),
        cost: row.get("cost"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

const JOB_COLUMNS: &str = "id, topic_id, seed_episode_id, status, error, episode_id, cost, \
                           created_at, started_at, finished_at";

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<CanonJob>> {
    let row = sqlx::query(&format!("SELECT {} FROM canon_jobs WHERE id = ?", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| job_from_row(&r)).transpose()
}

/// Requeue RUNNING jobs whose worker evidently died. Returns the number
/// of jobs returned to the queue.
pub async fn requeue_stale_jobs(pool: &SqlitePool, config: &JobsConfig) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - config.stale_after_mins * 60;
    let result = sqlx::query(
        "UPDATE canon_jobs SET status = 'queued', started_at = NULL \
         WHERE status = 'running' AND COALESCE(started_at, created_at) < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    let requeued = result.rows_affected();
    if requeued > 0 {
        warn!(requeued, "requeued stale running jobs");
    }
    Ok(requeued)
}

/// Claim the oldest QUEUED job. The conditional UPDATE is the ownership
/// handshake: whichever worker flips the row to RUNNING owns it.
pub async fn claim_next_job(pool: &SqlitePool) -> Result<Option<CanonJob>> {
    loop {
        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT id FROM canon_jobs WHERE status = 'queued' \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        let now = chrono::Utc::now().timestamp();
        let claimed = sqlx::query(
            "UPDATE canon_jobs SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(&id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return get_job(pool, &id).await;
        }
        // Another worker won the claim; try the next candidate
    }
}

async fn mark_failed(pool: &SqlitePool, job_id: &str, error: &str, cost: f64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE canon_jobs SET status = 'failed', error = ?, cost = ?, finished_at = ? \
         WHERE id = ?",
    )
    .bind(error)
    .bind(cost)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Run one claimed job to a terminal state.
///
/// Remaster attempts are bounded: a transcript that fails the quality
/// gate on the final attempt is accepted anyway, with the shortfall
/// logged. Pipeline errors and synthesis errors fail the job; upload
/// problems do not.
pub async fn process_job(
    pool: &SqlitePool,
    config: &PipelineConfig,
    audio: &AudioStage,
    primary: &dyn LlmBackend,
    secondary: &dyn LlmBackend,
    job: &CanonJob,
) -> Result<JobOutcome> {
    let topic = match store::get_topic(pool, &job.topic_id).await? {
        Some(t) => t,
        None => {
            let msg = format!("Unknown topic: {}", job.topic_id);
            mark_failed(pool, &job.id, &msg, 0.0).await?;
            return Ok(JobOutcome {
                job_id: job.id.clone(),
                status: JobStatus::Failed,
                episode_id: None,
                error: Some(msg),
                cost: 0.0,
                attempts: 0,
            });
        }
    };

    // Seed transcript: the job's recorded seed first, then whatever READY
    // episode the topic has. A remaster with nothing to remaster is a
    // data-integrity failure, not a retryable condition.
    let seed_transcript = match &job.seed_episode_id {
        Some(id) => store::get_episode(pool, id).await?.map(|e| e.transcript),
        None => None,
    };
    let seed_transcript = match seed_transcript {
        Some(t) => Some(t),
        None => store::latest_ready_episode(pool, &job.topic_id)
            .await?
            .map(|e| e.transcript),
    };
    let seed_transcript = match seed_transcript {
        Some(t) => t,
        None => {
            let msg = "remaster requires a seed transcript".to_string();
            mark_failed(pool, &job.id, &msg, 0.0).await?;
            return Ok(JobOutcome {
                job_id: job.id.clone(),
                status: JobStatus::Failed,
                episode_id: None,
                error: Some(msg),
                cost: 0.0,
                attempts: 0,
            });
        }
    };

    let pipeline = GenerationPipeline::new(primary, secondary, config);
    let mut total_calls = 0u32;
    let mut attempts = 0u32;
    let mut accepted = None;

    for attempt in 1..=config.max_remaster_attempts {
        attempts = attempt;
        let run = match pipeline
            .run(&topic.title, Some(&seed_transcript), PipelineMode::Remaster)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                let cost = total_calls as f64 * config.cost_per_call;
                let msg = format!("pipeline failed on attempt {}: {:#}", attempt, e);
                mark_failed(pool, &job.id, &msg, cost).await?;
                return Ok(JobOutcome {
                    job_id: job.id.clone(),
                    status: JobStatus::Failed,
                    episode_id: None,
                    error: Some(msg),
                    cost,
                    attempts,
                });
            }
        };

        total_calls += run.llm_calls;
        let passed = run.quality.as_ref().map(|q| q.passed).unwrap_or(false);
        if passed || attempt == config.max_remaster_attempts {
            if !passed {
                let average = run.quality.as_ref().map(|q| q.average).unwrap_or(0.0);
                warn!(
                    job_id = %job.id,
                    attempt,
                    average,
                    "quality gate not met on final attempt, accepting transcript"
                );
            }
            accepted = Some(run);
            break;
        }
        info!(job_id = %job.id, attempt, "quality gate failed, remastering again");
    }

    // The loop always runs at least once
    let run = accepted.ok_or_else(|| anyhow::anyhow!("remaster loop produced no transcript"))?;
    let cost = total_calls as f64 * config.cost_per_call;

    let episode_id = Uuid::new_v4().to_string();

    // Synthesis failure is fatal; a canon episode is a listening artifact
    let audio_url = if audio.is_enabled() {
        match audio.produce(&episode_id, &run.transcript).await {
            Ok(url) => url,
            Err(e) => {
                let msg = format!("audio synthesis failed: {:#}", e);
                mark_failed(pool, &job.id, &msg, cost).await?;
                return Ok(JobOutcome {
                    job_id: job.id.clone(),
                    status: JobStatus::Failed,
                    episode_id: None,
                    error: Some(msg),
                    cost,
                    attempts,
                });
            }
        }
    } else {
        None
    };

    // Episode insert, pointer swap, and job completion commit together.
    // The interim canon episode loses its flag in the same transaction.
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE episodes SET is_canon = 0 WHERE topic_id = ? AND is_canon = 1")
        .bind(&job.topic_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO episodes (id, topic_id, owner_id, title, transcript, audio_url, status, \
         is_canon, cost, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&episode_id)
    .bind(&job.topic_id)
    .bind(CANON_OWNER)
    .bind(&topic.title)
    .bind(&run.transcript)
    .bind(&audio_url)
    .bind(EpisodeStatus::Ready.as_str())
    .bind(cost)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE topics SET canon_episode_id = ? WHERE id = ?")
        .bind(&episode_id)
        .bind(&job.topic_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "UPDATE canon_jobs SET status = 'succeeded', episode_id = ?, cost = ?, finished_at = ? \
         WHERE id = ?",
    )
    .bind(&episode_id)
    .bind(cost)
    .bind(now)
    .bind(&job.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(job_id = %job.id, episode_id = %episode_id, cost, attempts, "canon job succeeded");

    Ok(JobOutcome {
        job_id: job.id.clone(),
        status: JobStatus::Succeeded,
        episode_id: Some(episode_id),
        error: None,
        cost,
        attempts,
    })
}

/// Requeue stale work, then drain up to `batch_limit` claims sequentially.
pub async fn run_jobs_batch(
    pool: &SqlitePool,
    jobs_config: &JobsConfig,
    pipeline_config: &PipelineConfig,
    audio: &AudioStage,
    primary: &dyn LlmBackend,
    secondary: &dyn LlmBackend,
) -> Result<JobBatchSummary> {
    let mut summary = JobBatchSummary {
        requeued_stale: requeue_stale_jobs(pool, jobs_config).await?,
        ..JobBatchSummary::default()
    };

    for _ in 0..jobs_config.batch_limit {
        let job = match claim_next_job(pool).await? {
            Some(job) => job,
            None => break,
        };
        summary.claimed += 1;

        // A storage error inside one job must not strand the claim in
        // RUNNING or stop the rest of the batch
        match process_job(pool, pipeline_config, audio, primary, secondary, &job).await {
            Ok(outcome) => match outcome.status {
                JobStatus::Succeeded => summary.succeeded += 1,
                _ => summary.failed += 1,
            },
            Err(e) => {
                let msg = format!("job processing failed: {:#}", e);
                warn!(job_id = %job.id, error = %msg, "marking job failed");
                mark_failed(pool, &job.id, &msg, 0.0).await?;
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}
