//! Core data models used throughout Curator.
//!
//! These types represent the content items, chunks, transcript segments, and
//! metadata blocks that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    YoutubeVideo,
    WebArticle,
}

impl ContentKind {
    /// Stable kind string used in archive layout and index payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::YoutubeVideo => "youtube_video",
            ContentKind::WebArticle => "web_article",
        }
    }

    /// Prefix of the `kind:external_id` content identifier.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ContentKind::YoutubeVideo => "youtube",
            ContentKind::WebArticle => "web",
        }
    }

    /// Kind string stamped on chunk records of this content kind.
    pub fn chunk_kind(&self) -> &'static str {
        match self {
            ContentKind::YoutubeVideo => "youtube_chunk",
            ContentKind::WebArticle => "web_chunk",
        }
    }

    pub fn parse(s: &str) -> Option<ContentKind> {
        match s {
            "youtube_video" => Some(ContentKind::YoutubeVideo),
            "web_article" => Some(ContentKind::WebArticle),
            _ => None,
        }
    }

    /// Recover the kind from a `kind:external_id` content identifier.
    pub fn of_content_id(id: &str) -> Option<ContentKind> {
        match id.split(':').next() {
            Some("youtube") => Some(ContentKind::YoutubeVideo),
            Some("web") => Some(ContentKind::WebArticle),
            _ => None,
        }
    }
}

/// One caption segment of a video transcript, as fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start offset in seconds from the beginning of the video.
    pub start: f64,
    /// Duration in seconds.
    pub duration: f64,
    pub text: String,
}

impl TranscriptSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Video-level metadata returned alongside a transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub channel: String,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub description: String,
}

/// Where a content item came from and when it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub url: String,
    /// Channel name, site domain, or other human-readable origin.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// One block of a structure-parsed web page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocBlock {
    pub kind: BlockKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Heading with its level (1–6).
    Heading(u8),
    Paragraph,
    Code,
    ListItem,
}

/// Abstract tree of a fetched web page, consumed by the web chunker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub title: Option<String>,
    pub blocks: Vec<DocBlock>,
}

/// Difficulty label of the normalized metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

/// Style label of the normalized metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    Tutorial,
    Analysis,
    Discussion,
    Demo,
    Interview,
    News,
    Review,
}

/// The structured metadata schema shared by both normalization phases.
///
/// Phase 1 emits it unnormalized; Phase 2 emits it with every tag in
/// `subject_matter`, `techniques`, and `tools` resolved to a canonical form.
/// List fields and the two enum labels are optional on the wire — LLMs omit
/// fields — and parse to empty defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub subject_matter: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub style: Option<Style>,
}

impl StructuredMetadata {
    /// All tag fields that are bound to the controlled vocabulary.
    pub fn vocabulary_tags(&self) -> impl Iterator<Item = &str> {
        self.subject_matter
            .iter()
            .chain(self.techniques.iter())
            .chain(self.tools.iter())
            .map(String::as_str)
    }
}

/// Token and cost accounting for one LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub model: String,
    pub prompt_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub wall_ms: u64,
}

/// One record of the `content` collection: a whole document with its
/// 1024-dim global embedding and denormalized payload fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Stable `kind:external_id` identifier.
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    /// Channel name or site domain.
    pub source: String,
    pub url: String,
    pub summary: String,
    /// Canonical tags (subject matter + techniques + tools).
    pub tags: Vec<String>,
    /// Unix seconds of first ingestion.
    pub created_at: i64,
    pub rating: Option<f64>,
    pub importance: Option<String>,
    pub projects: Vec<String>,
    /// Full normalized metadata block, as JSON.
    pub raw_metadata: serde_json::Value,
    /// Vocabulary version the tags were normalized against.
    pub vocab_version: String,
    pub embedding: Vec<f32>,
}

/// One record of the `content_chunks` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// `<doc_id>:chunk_<ordinal>`.
    pub id: String,
    pub doc_id: String,
    /// `youtube_chunk` or `web_chunk`.
    pub kind: String,
    /// Denormalized from the parent document.
    pub title: String,
    pub source: String,
    pub url: String,
    pub chunk_index: i64,
    /// Chunk text, materialized so retrieval can surface it directly.
    pub text: String,
    /// Character offsets into the source raw text.
    pub start_char: i64,
    pub end_char: i64,
    /// Timestamps in seconds; present for video chunks only.
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub local_summary: Option<String>,
    pub tags: Vec<String>,
    pub projects: Vec<String>,
    pub embedding: Vec<f32>,
}

/// Build the stable id of a chunk from its parent and ordinal.
pub fn chunk_id(doc_id: &str, ordinal: i64) -> String {
    format!("{}:chunk_{}", doc_id, ordinal)
}
