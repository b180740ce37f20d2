//! # Canon Cache
//!
//! A semantic content cache for AI-generated audio episodes.
//!
//! Canon Cache deduplicates free-form topic requests into canonical
//! topics (slug identity plus embedding-similarity clustering), records
//! usage signals against them, and promotes topics that prove popular to
//! permanently cached "canon" artifacts. Promotion queues a regeneration
//! job that remasters the episode through a multi-stage, quality-gated
//! pipeline; subsequent requests for the topic are served from the cache
//! at zero marginal cost.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌───────────┐
//! │ Resolver │──▶│ Signals  │──▶│  Scoring  │──▶│ Canon Jobs │
//! │ slug+vec │   │ requests │   │ promotion │   │ remaster   │
//! └────┬─────┘   └──────────┘   └───────────┘   └─────┬─────┘
//!      │                                              │
//!      ▼                                              ▼
//! ┌──────────┐                                  ┌───────────┐
//! │  Cache   │◀─────────────────────────────────│ Episodes  │
//! │ read path│                                  │  SQLite   │
//! └──────────┘                                  └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! canon init                             # create database
//! canon request "The Science of Sleep" --user alice
//! canon engage <episode-id> --user alice --completion 0.9 --saved
//! canon score                            # evaluate and promote topics
//! canon jobs                             # run queued remaster jobs
//! canon cache "The Science of Sleep"     # probe the read path
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`slug`] | Title normalization and slug identity |
//! | [`embedding`] | Embedding provider abstraction and vector math |
//! | [`resolver`] | Topic resolution and clustering |
//! | [`signals`] | Usage signal recording |
//! | [`scoring`] | Composite scoring and canon promotion |
//! | [`jobs`] | Canon job state machine and batch runner |
//! | [`pipeline`] | Multi-stage generation pipeline |
//! | [`llm`] | Chat completion backends |
//! | [`audio`] | Speech synthesis and media upload |
//! | [`cache`] | Cache read path |
//! | [`request`] | End-to-end request handling |
//! | [`store`] | Shared row mappers and lookups |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod audio;
pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod jobs;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod request;
pub mod resolver;
pub mod scoring;
pub mod signals;
pub mod slug;
pub mod store;
