//! # Canon Cache CLI (`canon`)
//!
//! The `canon` binary is the operational interface for the canon cache.
//! It provides commands for database initialization, topic resolution,
//! serving content requests, recording engagement, running promotion
//! batches, and processing canon jobs.
//!
//! ## Usage
//!
//! ```bash
//! canon --config ./config/canon.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `canon init` | Create the SQLite database and run schema migrations |
//! | `canon resolve "<topic>"` | Resolve a raw topic string to its canonical topic |
//! | `canon request "<topic>" --user <id>` | Serve a request: cache hit or fresh generation |
//! | `canon engage <episode-id> --user <id>` | Record listening engagement |
//! | `canon score` | Evaluate candidate topics and promote qualifying ones |
//! | `canon jobs` | Process queued canon remaster jobs |
//! | `canon cache "<topic>"` | Probe the cache read path without recording anything |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use canon_cache::audio::AudioStage;
use canon_cache::{
    cache, config, db, embedding, jobs, llm, migrate, request, resolver, scoring, signals, store,
};

/// Canon Cache CLI — a semantic content cache with usage-driven promotion
/// and quality-gated regeneration.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/canon.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "canon",
    about = "Canon Cache — semantic content cache with usage-driven promotion",
    version,
    long_about = "Canon Cache deduplicates free-form topic requests into canonical topics, \
    records usage signals, promotes popular topics to permanently cached canon artifacts, \
    and regenerates them through a quality-gated multi-stage pipeline."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/canon.toml`. Database, embedding, scoring,
    /// pipeline, job, and audio settings are read from this file.
    #[arg(long, global = true, default_value = "./config/canon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (topics,
    /// content_requests, canon_jobs, episodes). Idempotent — running it
    /// multiple times is safe.
    Init,

    /// Resolve a raw topic string to its canonical topic.
    ///
    /// Shows the topic id, slug, whether the topic was newly created, and
    /// any near-duplicate topics found during embedding lookup.
    Resolve {
        /// The raw topic string as a user would submit it.
        topic: String,
    },

    /// Serve a content request.
    ///
    /// Checks the canon cache first; a hit is served as a zero-cost copy.
    /// On a miss the topic is resolved, an episode is generated through
    /// the pipeline, and the request is recorded against the topic's
    /// usage signals.
    Request {
        /// The raw topic string.
        topic: String,

        /// Requester id the episode will be owned by.
        #[arg(long)]
        user: String,

        /// Generate a customized variant. Personal requests skip the
        /// cache and carry no promotion pressure.
        #[arg(long)]
        personal: bool,
    },

    /// Record engagement for a previously served episode.
    ///
    /// Updates the requester's most recent request for the episode. Only
    /// the provided fields are changed.
    Engage {
        /// Episode id that was served.
        episode_id: String,

        /// Requester id the engagement belongs to.
        #[arg(long)]
        user: String,

        /// Fraction of the episode listened, 0.0 to 1.0.
        #[arg(long)]
        completion: Option<f64>,

        /// Mark the episode as saved to the requester's library.
        #[arg(long)]
        saved: bool,

        /// Mark the episode as replayed.
        #[arg(long)]
        replayed: bool,
    },

    /// Evaluate candidate topics and promote qualifying ones.
    ///
    /// Refreshes every evaluated topic's engagement aggregates and
    /// composite score; topics clearing all promotion floors flip to
    /// canon and get a remaster job queued.
    Score {
        /// Evaluate a single topic instead of a batch.
        #[arg(long)]
        topic: Option<String>,

        /// Maximum number of topics to evaluate.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Process queued canon remaster jobs.
    ///
    /// Requeues stale running jobs, then claims and processes queued jobs
    /// strictly one at a time.
    Jobs {
        /// Maximum number of jobs to process in this run.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Probe the cache read path for a topic.
    ///
    /// Read-only: reports hit or miss without recording a request.
    Cache {
        /// The raw topic string.
        topic: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("canon_cache=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Resolve { topic } => {
            let pool = db::connect(&cfg).await?;
            let embedder = embedding::create_client(&cfg.embedding)?;
            let resolution =
                resolver::resolve(&pool, embedder.as_ref(), &cfg.embedding, &topic).await?;
            let resolved = store::get_topic(&pool, &resolution.topic_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("resolved topic disappeared"))?;

            println!("Topic: {} ({})", resolved.id, resolved.slug);
            println!(
                "{}",
                if resolution.is_new_topic {
                    "Created a new candidate topic."
                } else {
                    "Matched an existing topic."
                }
            );
            for similar in &resolution.similar {
                println!(
                    "  similar: {:.3}  {} ({})",
                    similar.similarity, similar.title, similar.slug
                );
            }
        }
        Commands::Request {
            topic,
            user,
            personal,
        } => {
            let pool = db::connect(&cfg).await?;

            // Cache hits never need provider credentials
            if !personal {
                if let Some(episode) = cache::serve_from_cache(&pool, &topic, &user).await? {
                    println!("Cache hit: episode {} (zero cost)", episode.id);
                    if let Some(url) = &episode.audio_url {
                        println!("Audio: {}", url);
                    }
                    return Ok(());
                }
            }

            let embedder = embedding::create_client(&cfg.embedding)?;
            let primary = llm::create_backend(&cfg.pipeline.primary_backend, &cfg.pipeline)?;
            let secondary = llm::create_backend(&cfg.pipeline.secondary_backend, &cfg.pipeline)?;
            let audio = AudioStage::new(&cfg.audio)?;

            let service = request::RequestService::new(
                &pool,
                &cfg,
                embedder.as_ref(),
                primary.as_ref(),
                secondary.as_ref(),
                &audio,
            );
            let outcome = service.handle(&topic, &user, personal).await?;
            let episode = outcome.episode();
            println!("Generated episode {} (cost ${:.2})", episode.id, episode.cost);
            if let Some(url) = &episode.audio_url {
                println!("Audio: {}", url);
            }
        }
        Commands::Engage {
            episode_id,
            user,
            completion,
            saved,
            replayed,
        } => {
            let pool = db::connect(&cfg).await?;
            let patch = signals::EngagementPatch {
                completion_pct: completion,
                saved: saved.then_some(true),
                replayed: replayed.then_some(true),
            };
            match signals::update_engagement(&pool, &episode_id, &user, patch).await? {
                Some(record) => {
                    println!(
                        "Engagement recorded: completion={:?} saved={:?} replayed={:?}",
                        record.completion_pct, record.saved, record.replayed
                    );
                }
                None => {
                    println!("No matching request found (or empty update); nothing recorded.");
                }
            }
        }
        Commands::Score { topic, limit } => {
            let pool = db::connect(&cfg).await?;
            match topic {
                Some(topic_id) => {
                    let outcome =
                        scoring::score_and_promote(&pool, &cfg.scoring, &topic_id).await?;
                    println!(
                        "Topic {}: score {:.3}, {}",
                        topic_id,
                        outcome.score,
                        if outcome.promoted { "PROMOTED" } else { "not promoted" }
                    );
                    for reason in &outcome.reasons {
                        println!("  + {}", reason);
                    }
                    for blocker in &outcome.blockers {
                        println!("  - {}", blocker);
                    }
                }
                None => {
                    let summary = scoring::run_scoring_batch(&pool, &cfg.scoring, limit).await?;
                    println!(
                        "Scoring batch: {} evaluated, {} promoted, {} failed",
                        summary.evaluated, summary.promoted, summary.failed
                    );
                    for (topic_id, error) in &summary.errors {
                        println!("  error [{}]: {}", topic_id, error);
                    }
                }
            }
        }
        Commands::Jobs { limit } => {
            let pool = db::connect(&cfg).await?;
            let primary = llm::create_backend(&cfg.pipeline.primary_backend, &cfg.pipeline)?;
            let secondary = llm::create_backend(&cfg.pipeline.secondary_backend, &cfg.pipeline)?;
            let audio = AudioStage::new(&cfg.audio)?;

            let mut jobs_cfg = cfg.jobs.clone();
            if let Some(limit) = limit {
                jobs_cfg.batch_limit = limit;
            }

            let summary = jobs::run_jobs_batch(
                &pool,
                &jobs_cfg,
                &cfg.pipeline,
                &audio,
                primary.as_ref(),
                secondary.as_ref(),
            )
            .await?;
            println!(
                "Jobs batch: {} requeued stale, {} claimed, {} succeeded, {} failed",
                summary.requeued_stale, summary.claimed, summary.succeeded, summary.failed
            );
        }
        Commands::Cache { topic } => {
            let pool = db::connect(&cfg).await?;
            match cache::check_cache(&pool, &topic).await? {
                Some(hit) => {
                    println!(
                        "Cache hit: topic {} -> episode {}",
                        hit.topic.slug, hit.episode.id
                    );
                    if let Some(url) = &hit.episode.audio_url {
                        println!("Audio: {}", url);
                    }
                }
                None => {
                    println!("Cache miss.");
                }
            }
        }
    }

    Ok(())
}
