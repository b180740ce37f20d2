//! Core data models for the canon cache.
//!
//! These types mirror the SQLite rows that flow through topic resolution,
//! signal recording, scoring, and canon job processing.

use anyhow::{bail, Result};
use serde::Serialize;

/// Lifecycle status of a topic.
///
/// A topic is born `Candidate`, flips to `Canon` exactly once when the
/// scoring engine promotes it, and may be parked `Cold` by an external
/// curation process to exclude it from future scoring batches. Topics are
/// never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Candidate,
    Canon,
    Cold,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Candidate => "candidate",
            TopicStatus::Canon => "canon",
            TopicStatus::Cold => "cold",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "candidate" => Ok(TopicStatus::Candidate),
            "canon" => Ok(TopicStatus::Canon),
            "cold" => Ok(TopicStatus::Cold),
            other => bail!("Unknown topic status: '{}'", other),
        }
    }
}

/// A canonical cluster of semantically equivalent requests.
///
/// The slug is the primary deduplication key; the embedding is only
/// consulted on slug-miss. Aggregate counters are denormalized here and
/// recomputed by the signal recorder and scoring engine.
#[derive(Debug, Clone)]
pub struct Topic {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub embedding: Option<Vec<f32>>,
    pub status: TopicStatus,
    pub request_count: i64,
    pub unique_users: i64,
    /// Median of recorded completion fractions, in [0, 1].
    pub completion_rate: f64,
    /// Saved requests divided by total requests, in [0, 1].
    pub save_rate: f64,
    pub canon_score: f64,
    pub canon_episode_id: Option<String>,
    pub canon_promoted_at: Option<i64>,
    pub created_at: i64,
}

/// Whether a content request counts toward canon promotion.
///
/// `Personal` requests (explicitly customized variants) are recorded for
/// accounting but excluded from promotion pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Personal,
    Candidate,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Personal => "personal",
            RequestKind::Candidate => "candidate",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "personal" => Ok(RequestKind::Personal),
            "candidate" => Ok(RequestKind::Candidate),
            other => bail!("Unknown request kind: '{}'", other),
        }
    }
}

/// One immutable usage event per content fulfillment.
///
/// Engagement fields start empty and are each set at most once by later
/// `update_engagement` calls (last write wins, no aggregation).
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: String,
    pub topic_id: String,
    pub requester_id: String,
    pub kind: RequestKind,
    pub cache_hit: bool,
    pub cost: Option<f64>,
    pub episode_id: Option<String>,
    pub completion_pct: Option<f64>,
    pub saved: Option<bool>,
    pub replayed: Option<bool>,
    pub created_at: i64,
}

/// Canon job lifecycle. Terminal states are `Succeeded` and `Failed`;
/// a job never transitions backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => bail!("Unknown job status: '{}'", other),
        }
    }
}

/// A regeneration attempt for one topic, created atomically with its
/// promotion.
#[derive(Debug, Clone)]
pub struct CanonJob {
    pub id: String,
    pub topic_id: String,
    /// Best existing personal episode, used as structural reference.
    pub seed_episode_id: Option<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Produced episode id, set on success.
    pub episode_id: Option<String>,
    pub cost: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Episode readiness. Only `Ready` episodes are served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    Pending,
    Ready,
    Failed,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Ready => "ready",
            EpisodeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EpisodeStatus::Pending),
            "ready" => Ok(EpisodeStatus::Ready),
            "failed" => Ok(EpisodeStatus::Failed),
            other => bail!("Unknown episode status: '{}'", other),
        }
    }
}

/// A served artifact: generated transcript plus an optional audio pointer.
///
/// This is the minimal shape the core depends on: an id, a status with a
/// terminal ready state, a canon flag, and text/media pointers.
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: String,
    pub topic_id: String,
    pub owner_id: String,
    pub title: String,
    pub transcript: String,
    pub audio_url: Option<String>,
    pub status: EpisodeStatus,
    pub is_canon: bool,
    pub cost: f64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [TopicStatus::Candidate, TopicStatus::Canon, TopicStatus::Cold] {
            assert_eq!(TopicStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(TopicStatus::parse("archived").is_err());
        assert!(JobStatus::parse("cancelled").is_err());
        assert!(EpisodeStatus::parse("queued").is_err());
        assert!(RequestKind::parse("bulk").is_err());
    }
}
