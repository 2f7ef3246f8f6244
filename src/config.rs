//! Configuration parsing and validation.
//!
//! Curator is configured via a TOML file (default: `config/curator.toml`).
//! The config defines the archive root, the index database path, the queue
//! root, fetcher and proxy settings, chunker parameters, embedding and LLM
//! provider settings, normalizer tuning, and the mode-dependent ranker
//! weights.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub index: IndexConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    pub embedder: EmbedderConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub personas: Vec<PersonaSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
    /// Connections in the single writable pool this process may hold.
    #[serde(default = "default_writer_connections")]
    pub writer_connections: u32,
}

fn default_writer_connections() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub root: PathBuf,
}

/// Optional rotating HTTP proxy, applied to all outbound fetches.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    /// Override of the YouTube origin; used for mirrors and tests.
    #[serde(default)]
    pub youtube_base: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_retries: default_fetch_retries(),
            youtube_base: None,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_fetch_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub youtube: WindowConfig,
}

/// Rolling-window admission budget shared by manual and scheduled fetches.
#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_manual")]
    pub max_manual: usize,
    #[serde(default = "default_max_scheduled")]
    pub max_scheduled: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_manual: default_max_manual(),
            max_scheduled: default_max_scheduled(),
        }
    }
}

fn default_window_seconds() -> u64 {
    900
}
fn default_max_manual() -> usize {
    5
}
fn default_max_scheduled() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChunkerConfig {
    #[serde(default)]
    pub transcript: TranscriptChunkerConfig,
    #[serde(default)]
    pub web: WebChunkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptChunkerConfig {
    #[serde(default = "default_transcript_target")]
    pub target_tokens: usize,
    #[serde(default = "default_hard_cap")]
    pub hard_cap_tokens: usize,
    /// Gap between consecutive segments that forces a chunk boundary.
    #[serde(default = "default_pause_seconds")]
    pub pause_seconds: f64,
    /// Trailing segments of the previous chunk repeated at the next head.
    #[serde(default = "default_overlap_segments")]
    pub overlap_segments: usize,
}

impl Default for TranscriptChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_transcript_target(),
            hard_cap_tokens: default_hard_cap(),
            pause_seconds: default_pause_seconds(),
            overlap_segments: default_overlap_segments(),
        }
    }
}

fn default_transcript_target() -> usize {
    2500
}
fn default_hard_cap() -> usize {
    6000
}
fn default_pause_seconds() -> f64 {
    9.0
}
fn default_overlap_segments() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebChunkerConfig {
    #[serde(default = "default_web_target")]
    pub target_tokens: usize,
    #[serde(default = "default_hard_cap")]
    pub hard_cap_tokens: usize,
}

impl Default for WebChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_web_target(),
            hard_cap_tokens: default_hard_cap(),
        }
    }
}

fn default_web_target() -> usize {
    1500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbedderConfig {
    pub global: EmbedderModelConfig,
    pub chunk: EmbedderModelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbedderModelConfig {
    /// One of `openai`, `ollama`, `local`.
    pub provider: String,
    pub model: String,
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    /// Provider endpoint override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

fn default_dim() -> usize {
    1024
}
fn default_context_tokens() -> usize {
    8192
}
fn default_batch_size() -> usize {
    32
}
fn default_embed_retries() -> u32 {
    3
}
fn default_embed_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// One of `openai`, `ollama` (OpenAI-compatible chat endpoint).
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    /// Dollars per million input tokens, for archived cost records.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    /// Semantic neighbors handed to Phase 2 as tagging context.
    #[serde(default = "default_neighbors_k")]
    pub neighbors_k: usize,
    /// Canonical forms of the active vocabulary enumerated in the prompt.
    #[serde(default = "default_vocabulary_top_n")]
    pub vocabulary_top_n: usize,
    #[serde(default = "default_parse_attempts")]
    pub max_parse_attempts: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            neighbors_k: default_neighbors_k(),
            vocabulary_top_n: default_vocabulary_top_n(),
            max_parse_attempts: default_parse_attempts(),
        }
    }
}

fn default_neighbors_k() -> usize {
    5
}
fn default_vocabulary_top_n() -> usize {
    30
}
fn default_parse_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankerConfig {
    #[serde(default)]
    pub weights: ModeWeights,
    /// Chunk candidates pulled before document grouping.
    #[serde(default = "default_candidate_chunks")]
    pub candidate_chunks: usize,
    #[serde(default = "default_top_chunks_per_doc")]
    pub top_chunks_per_doc: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            weights: ModeWeights::default(),
            candidate_chunks: default_candidate_chunks(),
            top_chunks_per_doc: default_top_chunks_per_doc(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_candidate_chunks() -> usize {
    120
}
fn default_top_chunks_per_doc() -> usize {
    3
}
fn default_final_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModeWeights {
    #[serde(default = "default_search_weights")]
    pub search: WeightSet,
    #[serde(default = "default_recommendation_weights")]
    pub recommendation: WeightSet,
    #[serde(default = "default_application_weights")]
    pub application: WeightSet,
}

impl Default for ModeWeights {
    fn default() -> Self {
        Self {
            search: default_search_weights(),
            recommendation: default_recommendation_weights(),
            application: default_application_weights(),
        }
    }
}

/// Weights of one query mode; must sum to 1.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WeightSet {
    pub chunk: f64,
    pub global: f64,
    pub persona: f64,
    pub pref: f64,
}

impl WeightSet {
    pub fn sum(&self) -> f64 {
        self.chunk + self.global + self.persona + self.pref
    }
}

fn default_search_weights() -> WeightSet {
    WeightSet {
        chunk: 0.60,
        global: 0.30,
        persona: 0.05,
        pref: 0.05,
    }
}

fn default_recommendation_weights() -> WeightSet {
    WeightSet {
        chunk: 0.10,
        global: 0.30,
        persona: 0.35,
        pref: 0.25,
    }
}

fn default_application_weights() -> WeightSet {
    WeightSet {
        chunk: 0.45,
        global: 0.25,
        persona: 0.15,
        pref: 0.15,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Retry budget per work item before escalating to terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before a retryable item re-enters pending.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    30
}

/// A persona declared in configuration; its vector is built from rated
/// content at runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct PersonaSeed {
    pub label: String,
    pub description: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunkers
    if config.chunker.transcript.target_tokens == 0 || config.chunker.web.target_tokens == 0 {
        anyhow::bail!("chunker target_tokens must be > 0");
    }
    if config.chunker.transcript.hard_cap_tokens < config.chunker.transcript.target_tokens {
        anyhow::bail!("chunker.transcript.hard_cap_tokens must be >= target_tokens");
    }
    if config.chunker.web.hard_cap_tokens < config.chunker.web.target_tokens {
        anyhow::bail!("chunker.web.hard_cap_tokens must be >= target_tokens");
    }

    // Validate embedders: both collections share one vector dimension.
    if config.embedder.global.dim == 0 {
        anyhow::bail!("embedder.global.dim must be > 0");
    }
    if config.embedder.global.dim != config.embedder.chunk.dim {
        anyhow::bail!(
            "embedder.global.dim ({}) must equal embedder.chunk.dim ({})",
            config.embedder.global.dim,
            config.embedder.chunk.dim
        );
    }
    if config.chunker.transcript.hard_cap_tokens >= config.embedder.chunk.context_tokens {
        anyhow::bail!("chunker.transcript.hard_cap_tokens must be below the chunk embedder context");
    }
    for (label, emb) in [
        ("embedder.global", &config.embedder.global),
        ("embedder.chunk", &config.embedder.chunk),
    ] {
        match emb.provider.as_str() {
            "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown {} provider: '{}'. Must be openai, ollama, or local.",
                label,
                other
            ),
        }
    }

    // Validate LLM
    match config.llm.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be openai or ollama.", other),
    }

    // Validate ranker weights
    for (mode, weights) in [
        ("search", &config.ranker.weights.search),
        ("recommendation", &config.ranker.weights.recommendation),
        ("application", &config.ranker.weights.application),
    ] {
        if (weights.sum() - 1.0).abs() > 1e-6 {
            anyhow::bail!(
                "ranker.weights.{} must sum to 1.0 (got {})",
                mode,
                weights.sum()
            );
        }
    }

    if config.rate_limit.youtube.window_seconds == 0 {
        anyhow::bail!("rate_limit.youtube.window_seconds must be > 0");
    }
    if config.ingest.max_attempts == 0 {
        anyhow::bail!("ingest.max_attempts must be >= 1");
    }

    Ok(config)
}
