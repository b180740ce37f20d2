//! LLM chat backends used by the generation pipeline.
//!
//! Two remote providers are supported so the drafting stage can pull from
//! genuinely different model families. Both share the same retry policy
//! as the embedding clients: 429/5xx and network errors retried with
//! exponential backoff, other 4xx fatal. A stage call that exhausts its
//! retries fails the whole pipeline invocation.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::PipelineConfig;

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-2024-11-20";
const MAX_COMPLETION_TOKENS: u32 = 16384;

/// A chat completion backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short provider label used in logs and draft attribution.
    fn name(&self) -> &str;
    /// One system + user turn, returning the assistant text.
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String>;
}

/// Instantiate a backend by provider name (`anthropic` or `openai`).
pub fn create_backend(provider: &str, config: &PipelineConfig) -> Result<Box<dyn LlmBackend>> {
    match provider {
        "anthropic" => Ok(Box::new(AnthropicBackend::new(config)?)),
        "openai" => Ok(Box::new(OpenAiBackend::new(config)?)),
        other => bail!("Unknown LLM backend: {}", other),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Shared retry loop: POST `body` to `url` with `headers`, parse the
/// assistant text out of the response with `extract`.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
    provider: &str,
    extract: fn(&serde_json::Value) -> Result<String>,
) -> Result<String> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        for (name, value) in headers {
            req = req.header(*name, value);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return extract(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        provider,
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", provider, status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} call failed after retries", provider)))
}

// ============ Anthropic backend ============

/// Backend for the Anthropic Messages API. Requires `ANTHROPIC_API_KEY`.
pub struct AnthropicBackend {
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl AnthropicBackend {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            bail!("ANTHROPIC_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config
                .primary_model
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
        let client = http_client(self.timeout_secs)?;

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "temperature": temperature,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        post_with_retry(
            &client,
            "https://api.anthropic.com/v1/messages",
            &[
                ("x-api-key", api_key),
                ("anthropic-version", "2023-06-01".to_string()),
                ("Content-Type", "application/json".to_string()),
            ],
            &body,
            self.max_retries,
            "Anthropic",
            parse_anthropic_response,
        )
        .await
    }
}

fn parse_anthropic_response(json: &serde_json::Value) -> Result<String> {
    json.get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Anthropic response: missing content text"))
}

// ============ OpenAI backend ============

/// Backend for the OpenAI chat completions API. Requires `OPENAI_API_KEY`.
pub struct OpenAiBackend {
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiBackend {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config
                .secondary_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = http_client(self.timeout_secs)?;

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "temperature": temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        post_with_retry(
            &client,
            "https://api.openai.com/v1/chat/completions",
            &[
                ("Authorization", format!("Bearer {}", api_key)),
                ("Content-Type", "application/json".to_string()),
            ],
            &body,
            self.max_retries,
            "OpenAI",
            parse_openai_response,
        )
        .await
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_anthropic_response() {
        let json = serde_json::json!({
            "content": [{"type": "text", "text": "hello"}]
        });
        assert_eq!(parse_anthropic_response(&json).unwrap(), "hello");
    }

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), "hi");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let json = serde_json::json!({"content": []});
        assert!(parse_anthropic_response(&json).is_err());
        let json = serde_json::json!({"choices": [{}]});
        assert!(parse_openai_response(&json).is_err());
    }
}
