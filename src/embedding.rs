//! Embedding providers and vector utilities.
//!
//! Two logical embedding functions drive the index: a document-level one for
//! the `content` collection (and persona vectors) and a chunk-level one for
//! `content_chunks`. Both are configured independently but must emit
//! identically-shaped vectors (1024 dims by default) so every record
//! participates in the same ranker.
//!
//! Supported providers:
//! - **`openai`** — `POST /v1/embeddings` with the configured model and an
//!   explicit `dimensions` field; batching, retry, and backoff.
//! - **`ollama`** — a local Ollama instance's `/api/embed` endpoint.
//! - **`local`** — fastembed (bge-large-en-v1.5, 1024 dims) behind the
//!   `local-embeddings` feature; no network calls after model download.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors retry with exponential
//! backoff (1s, 2s, 4s, … capped at 2^5); other 4xx fail immediately.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::EmbedderModelConfig;

/// Approximate chars-per-token ratio used for context budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate for provider context budgeting.
pub fn approx_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector per input text, in order. Every returned vector is
/// validated against the configured dimension; a mismatch is an error, not a
/// silent truncation.
pub async fn embed_texts(config: &EmbedderModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let vectors = match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await?,
        "ollama" => embed_ollama(config, texts).await?,
        #[cfg(feature = "local-embeddings")]
        "local" => embed_local(config, texts).await?,
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    };

    if vectors.len() != texts.len() {
        bail!(
            "Embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        );
    }
    for v in &vectors {
        if v.len() != config.dim {
            bail!(
                "Embedding dimension mismatch: expected {}, model '{}' returned {}",
                config.dim,
                config.model,
                v.len()
            );
        }
    }

    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(config: &EmbedderModelConfig, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Embed a whole document into one global vector.
///
/// A text that exceeds the model's context budget is split into two or three
/// large slices on char boundaries; the slice vectors are mean-pooled into
/// the final vector and discarded.
pub async fn embed_global(config: &EmbedderModelConfig, text: &str) -> Result<Vec<f32>> {
    let budget_chars = config.context_tokens * CHARS_PER_TOKEN;
    if text.len() <= budget_chars {
        return embed_query(config, text).await;
    }

    let slices = slice_for_context(text, budget_chars);
    let vectors = embed_texts(config, &slices).await?;
    Ok(mean_pool(&vectors))
}

/// Split an oversized text into 2–3 near-even slices under `budget_chars`,
/// breaking on whitespace where possible.
pub fn slice_for_context(text: &str, budget_chars: usize) -> Vec<String> {
    let n = text.len().div_ceil(budget_chars).clamp(2, 3);
    let target = text.len().div_ceil(n);

    let mut slices = Vec::with_capacity(n);
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= target || slices.len() == n - 1 {
            slices.push(remaining.to_string());
            break;
        }
        let mut split_at = floor_char_boundary(remaining, target);
        if let Some(ws) = remaining[..split_at].rfind(char::is_whitespace) {
            if ws > 0 {
                split_at = ws + 1;
            }
        }
        slices.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }
    slices
}

pub(crate) fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Element-wise mean of same-length vectors.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Vec<f32> {
    if vectors.is_empty() {
        return Vec::new();
    }
    let dim = vectors[0].len();
    let mut out = vec![0.0f32; dim];
    for v in vectors {
        for (o, x) in out.iter_mut().zip(v.iter()) {
            *o += x;
        }
    }
    let n = vectors.len() as f32;
    for o in &mut out {
        *o /= n;
    }
    out
}

// ============ OpenAI provider ============

async fn embed_openai(config: &EmbedderModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .or_else(|_| std::env::var("LLM_API_KEY"))
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

    let base = config
        .url
        .as_deref()
        .unwrap_or("https://api.openai.com/v1")
        .trim_end_matches('/')
        .to_string();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
        "dimensions": config.dim,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/embeddings", base))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_openai_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "Embedding API error {}: {}",
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("Embedding API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama provider ============

async fn embed_ollama(config: &EmbedderModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/embed", url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_ollama_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "Ollama API error {}: {}",
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("Ollama API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url,
                    e
                ));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")))
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ Local provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
async fn embed_local(config: &EmbedderModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    // Only the 1024-dim model is wired up; the index dimension is fixed.
    if config.model != "bge-large-en-v1.5" {
        bail!(
            "Unknown local embedding model: '{}'. Supported: bge-large-en-v1.5",
            config.model
        );
    }

    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::BGELargeENV15)
                .with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        let embeddings = model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;

        Ok(embeddings)
    })
    .await?
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
