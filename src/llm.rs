//! Chat-completion client for the tag normalizer.
//!
//! Speaks the OpenAI-compatible `/chat/completions` shape, which covers both
//! the hosted provider (`openai`, keyed by `OPENAI_API_KEY` / `LLM_API_KEY`)
//! and a local Ollama instance (`ollama`, no key). Every call returns the
//! model text together with a usage record — token counts, wall time, and
//! the dollar cost derived from the configured per-million-token prices —
//! which the caller archives next to the output.
//!
//! Retry strategy matches the embedder: 429/5xx/network errors back off
//! exponentially up to `max_retries`; other 4xx fail immediately.

use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::models::LlmUsage;

/// One completed chat call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: LlmUsage,
}

/// Stable identifier of a prompt template: first 16 hex chars of its SHA-256.
pub fn prompt_id(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn endpoint(config: &LlmConfig) -> Result<(String, Option<String>), LlmError> {
    match config.provider.as_str() {
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY")
                .or_else(|_| std::env::var("LLM_API_KEY"))
                .map_err(|_| LlmError::MissingApiKey("OPENAI_API_KEY"))?;
            let base = config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string();
            Ok((base, Some(key)))
        }
        _ => {
            // Ollama's OpenAI-compatible endpoint; no key needed.
            let base = config
                .base_url
                .as_deref()
                .unwrap_or("http://localhost:11434/v1")
                .trim_end_matches('/')
                .to_string();
            Ok((base, None))
        }
    }
}

/// Run one chat completion with a system and a user message.
///
/// `prompt_template_id` is stored on the usage record so archived outputs can
/// be traced back to the exact prompt revision that produced them.
pub async fn chat(
    config: &LlmConfig,
    prompt_template_id: &str,
    system: &str,
    user: &str,
) -> Result<LlmResponse, LlmError> {
    let (base, api_key) = endpoint(config)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LlmError::Transient(e.to_string()))?;

    let body = serde_json::json!({
        "model": config.model,
        "temperature": 0.2,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
    });

    let started = Instant::now();
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(format!("{}/chat/completions", base))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| LlmError::Malformed(e.to_string()))?;
                    return parse_chat_response(config, prompt_template_id, &json, started);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(LlmError::Transient(format!(
                        "HTTP {}: {}",
                        status, body_text
                    )));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                return Err(LlmError::Provider {
                    status: status.as_u16(),
                    body: body_text,
                });
            }
            Err(e) => {
                last_err = Some(LlmError::Transient(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| LlmError::Transient("chat failed after retries".into())))
}

fn parse_chat_response(
    config: &LlmConfig,
    prompt_template_id: &str,
    json: &serde_json::Value,
    started: Instant,
) -> Result<LlmResponse, LlmError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))?
        .to_string();

    let input_tokens = json
        .pointer("/usage/prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = json
        .pointer("/usage/completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let usage = LlmUsage {
        model: config.model.clone(),
        prompt_id: prompt_template_id.to_string(),
        input_tokens,
        output_tokens,
        cost_usd: cost_usd(config, input_tokens, output_tokens),
        wall_ms: started.elapsed().as_millis() as u64,
    };

    Ok(LlmResponse { text, usage })
}

/// Dollar cost of a call at the configured per-million-token prices.
pub fn cost_usd(config: &LlmConfig, input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * config.input_cost_per_mtok
        + output_tokens as f64 * config.output_cost_per_mtok)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn config(base: &str) -> LlmConfig {
        LlmConfig {
            provider: "ollama".into(),
            model: "gpt-4o-mini".into(),
            base_url: Some(base.to_string()),
            timeout_secs: 5,
            max_retries: 1,
            input_cost_per_mtok: 0.15,
            output_cost_per_mtok: 0.60,
        }
    }

    #[test]
    fn test_prompt_id_stable() {
        let a = prompt_id("extract tags");
        let b = prompt_id("extract tags");
        let c = prompt_id("extract tags v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_cost_usd() {
        let cfg = config("http://x");
        let cost = cost_usd(&cfg, 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
        assert_eq!(cost_usd(&cfg, 0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_chat_parses_text_and_usage() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"title\": \"T\"}"}}],
                "usage": {"prompt_tokens": 1200, "completion_tokens": 240}
            }));
        });

        let cfg = config(&server.base_url());
        let resp = chat(&cfg, "abcd", "system", "user").await.unwrap();
        assert_eq!(resp.text, "{\"title\": \"T\"}");
        assert_eq!(resp.usage.input_tokens, 1200);
        assert_eq!(resp.usage.output_tokens, 240);
        assert_eq!(resp.usage.prompt_id, "abcd");
        assert!((resp.usage.cost_usd - (1200.0 * 0.15 + 240.0 * 0.60) / 1e6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_chat_retries_on_500_then_succeeds() {
        let server = MockServer::start();
        let fail = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(500);
        });

        let cfg = config(&server.base_url());
        let err = chat(&cfg, "p", "s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::Transient(_)));
        // One initial try plus one retry.
        assert_eq!(fail.hits(), 2);
    }

    #[tokio::test]
    async fn test_chat_client_error_fails_fast() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(400).body("bad request");
        });

        let cfg = config(&server.base_url());
        let err = chat(&cfg, "p", "s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::Provider { status: 400, .. }));
        assert_eq!(mock.hits(), 1);
    }
}
