//! Audio synthesis and media upload.
//!
//! Synthesis failure is fatal to the calling job; upload failure is not.
//! An episode that narrates but never reaches the media store keeps its
//! transcript and simply carries no audio pointer.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::AudioConfig;

const DEFAULT_TTS_MODEL: &str = "tts-1";

/// Text-to-speech provider seam.
#[async_trait]
pub trait AudioSynthesizer: Send + Sync {
    /// Render a transcript to encoded audio bytes (mp3).
    async fn synthesize(&self, transcript: &str) -> Result<Vec<u8>>;
}

/// Instantiate a synthesizer by provider name, or `None` when audio is
/// disabled.
pub fn create_synthesizer(config: &AudioConfig) -> Result<Option<Box<dyn AudioSynthesizer>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Box::new(OpenAiTts::new(config)?))),
        other => bail!("Unknown audio provider: {}", other),
    }
}

/// Synthesis plus upload, bundled for the job runner.
pub struct AudioStage {
    synthesizer: Option<Box<dyn AudioSynthesizer>>,
    upload_url: Option<String>,
    timeout_secs: u64,
}

impl AudioStage {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        Ok(Self {
            synthesizer: create_synthesizer(config)?,
            upload_url: config.upload_url.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// A stage that produces no audio, used when the provider is disabled.
    pub fn disabled() -> Self {
        Self {
            synthesizer: None,
            upload_url: None,
            timeout_secs: 1,
        }
    }

    /// Test and embedding seam: wrap an arbitrary synthesizer.
    pub fn with_synthesizer(
        synthesizer: Box<dyn AudioSynthesizer>,
        upload_url: Option<String>,
    ) -> Self {
        Self {
            synthesizer: Some(synthesizer),
            upload_url,
            timeout_secs: 30,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Synthesize and upload audio for one episode. Returns the stored
    /// media URL, or `None` when audio is disabled or the upload failed.
    /// Synthesis errors propagate to the caller.
    pub async fn produce(&self, episode_id: &str, transcript: &str) -> Result<Option<String>> {
        let synthesizer = match &self.synthesizer {
            Some(s) => s,
            None => return Ok(None),
        };

        let bytes = synthesizer.synthesize(transcript).await?;

        let base = match &self.upload_url {
            Some(url) => url.trim_end_matches('/'),
            None => {
                warn!(episode_id, "no media store configured, discarding synthesized audio");
                return Ok(None);
            }
        };

        let target = format!("{base}/{episode_id}.mp3");
        match self.upload(&target, bytes).await {
            Ok(()) => Ok(Some(target)),
            Err(e) => {
                warn!(episode_id, error = %e, "audio upload failed, episode will have no audio");
                Ok(None)
            }
        }
    }

    async fn upload(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;
        let response = client
            .put(url)
            .header("Content-Type", "audio/mpeg")
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("media store returned {}", response.status());
        }
        Ok(())
    }
}

// ============ OpenAI TTS ============

/// OpenAI speech synthesis. Requires `OPENAI_API_KEY`.
pub struct OpenAiTts {
    voice: String,
    timeout_secs: u64,
}

impl OpenAiTts {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            voice: config.voice.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl AudioSynthesizer for OpenAiTts {
    async fn synthesize(&self, transcript: &str) -> Result<Vec<u8>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": DEFAULT_TTS_MODEL,
            "voice": self.voice,
            "input": transcript,
        });

        let response = client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI TTS error {}: {}", status, body_text);
        }

        Ok(response.bytes().await?.to_vec())
    }
}
