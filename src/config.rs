use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cosine similarity at or above which a new title is clustered onto
    /// an existing topic.
    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,
    /// Lower bound for reporting near-miss candidates back to the caller.
    #[serde(default = "default_candidate_threshold")]
    pub candidate_threshold: f32,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
            cluster_threshold: default_cluster_threshold(),
            candidate_threshold: default_candidate_threshold(),
            candidate_limit: default_candidate_limit(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cluster_threshold() -> f32 {
    0.92
}
fn default_candidate_threshold() -> f32 {
    0.80
}
fn default_candidate_limit() -> usize {
    5
}

/// Promotion thresholds and composite score weights.
///
/// The defaults encode the production policy: eligibility is a strict
/// conjunction of all four floors, and the two normalization caps stop a
/// single viral topic from saturating its own score ceiling.
#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_min_requests")]
    pub min_requests: i64,
    #[serde(default = "default_min_unique_users")]
    pub min_unique_users: i64,
    #[serde(default = "default_min_completion_rate")]
    pub min_completion_rate: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_request_cap")]
    pub request_cap: f64,
    #[serde(default = "default_user_cap")]
    pub user_cap: f64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_requests: default_min_requests(),
            min_unique_users: default_min_unique_users(),
            min_completion_rate: default_min_completion_rate(),
            min_score: default_min_score(),
            request_cap: default_request_cap(),
            user_cap: default_user_cap(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_min_requests() -> i64 {
    5
}
fn default_min_unique_users() -> i64 {
    3
}
fn default_min_completion_rate() -> f64 {
    0.6
}
fn default_min_score() -> f64 {
    0.4
}
fn default_request_cap() -> f64 {
    50.0
}
fn default_user_cap() -> f64 {
    20.0
}
fn default_batch_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Backend for research, judging, drift check, and enhancement.
    #[serde(default = "default_primary_backend")]
    pub primary_backend: String,
    /// Second drafting backend; diversity of approach, not redundancy.
    #[serde(default = "default_secondary_backend")]
    pub secondary_backend: String,
    #[serde(default)]
    pub primary_model: Option<String>,
    #[serde(default)]
    pub secondary_model: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_remaster_attempts")]
    pub max_remaster_attempts: u32,
    /// Quality gate floor on the eight-dimension average.
    #[serde(default = "default_gate_min_average")]
    pub gate_min_average: f64,
    /// Quality gate floor on any single dimension.
    #[serde(default = "default_gate_min_dimension")]
    pub gate_min_dimension: f64,
    /// Flat cost estimate per LLM call, used for job cost metering.
    #[serde(default = "default_cost_per_call")]
    pub cost_per_call: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            primary_backend: default_primary_backend(),
            secondary_backend: default_secondary_backend(),
            primary_model: None,
            secondary_model: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            max_remaster_attempts: default_max_remaster_attempts(),
            gate_min_average: default_gate_min_average(),
            gate_min_dimension: default_gate_min_dimension(),
            cost_per_call: default_cost_per_call(),
        }
    }
}

fn default_primary_backend() -> String {
    "anthropic".to_string()
}
fn default_secondary_backend() -> String {
    "openai".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    180
}
fn default_llm_max_retries() -> u32 {
    3
}
fn default_max_remaster_attempts() -> u32 {
    2
}
fn default_gate_min_average() -> f64 {
    7.0
}
fn default_gate_min_dimension() -> f64 {
    5.0
}
fn default_cost_per_call() -> f64 {
    0.05
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_jobs_batch_limit")]
    pub batch_limit: i64,
    /// RUNNING jobs older than this are requeued by the batch sweep.
    #[serde(default = "default_stale_after_mins")]
    pub stale_after_mins: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_jobs_batch_limit(),
            stale_after_mins: default_stale_after_mins(),
        }
    }
}

fn default_jobs_batch_limit() -> i64 {
    5
}
fn default_stale_after_mins() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_audio_provider")]
    pub provider: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Media store base URL; synthesized audio is PUT to `<base>/<id>.mp3`.
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default = "default_audio_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_audio_provider(),
            voice: default_voice(),
            upload_url: None,
            timeout_secs: default_audio_timeout_secs(),
        }
    }
}

fn default_audio_provider() -> String {
    "disabled".to_string()
}
fn default_voice() -> String {
    "onyx".to_string()
}
fn default_audio_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate embedding: provider name first, then its requirements
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if !(0.0..=1.0).contains(&config.embedding.cluster_threshold) {
        anyhow::bail!("embedding.cluster_threshold must be in [0.0, 1.0]");
    }

    // Validate scoring
    if config.scoring.request_cap <= 0.0 || config.scoring.user_cap <= 0.0 {
        anyhow::bail!("scoring.request_cap and scoring.user_cap must be > 0");
    }
    if config.scoring.batch_limit < 1 {
        anyhow::bail!("scoring.batch_limit must be >= 1");
    }

    // Validate pipeline
    for backend in [
        config.pipeline.primary_backend.as_str(),
        config.pipeline.secondary_backend.as_str(),
    ] {
        match backend {
            "anthropic" | "openai" => {}
            other => anyhow::bail!(
                "Unknown pipeline backend: '{}'. Must be anthropic or openai.",
                other
            ),
        }
    }
    if config.pipeline.max_remaster_attempts < 1 {
        anyhow::bail!("pipeline.max_remaster_attempts must be >= 1");
    }

    // Validate jobs
    if config.jobs.batch_limit < 1 {
        anyhow::bail!("jobs.batch_limit must be >= 1");
    }
    if config.jobs.stale_after_mins < 1 {
        anyhow::bail!("jobs.stale_after_mins must be >= 1");
    }

    Ok(config)
}
