//! Two-phase semantic tag normalization.
//!
//! **Phase 1** extracts a structured metadata block from the raw transcript
//! or page text. The prompt forbids normalization: the model records what is
//! actually present, unbiased by any vocabulary.
//!
//! **Phase 2** consolidates the Phase-1 tags against the active controlled
//! vocabulary. The model sees the tags of the most semantically similar
//! already-normalized items plus an enumeration of the vocabulary's top
//! canonical forms, reuses a canonical form whenever one fits, and invents a
//! new one only when nothing reasonable exists. Invented forms are tracked
//! as tentative until a consolidation run promotes them.
//!
//! Splitting the passes keeps the raw extraction reusable: re-normalizing
//! against a newer vocabulary re-runs Phase 2 only.
//!
//! Both passes parse defensively: markdown fences are stripped, missing
//! optional fields become empty defaults, and only a missing title/summary
//! after the attempt budget surfaces as [`NormalizeError::Malformed`].

use tracing::warn;

use crate::config::{LlmConfig, NormalizerConfig};
use crate::error::NormalizeError;
use crate::llm;
use crate::models::{LlmUsage, StructuredMetadata};
use crate::vocab::Vocabulary;

/// Input text beyond this many chars is truncated before prompting; well
/// past the point of diminishing returns for tagging.
const MAX_INPUT_CHARS: usize = 48_000;

const PHASE1_SYSTEM: &str = "You extract structured metadata from long-form content. \
Respond with a single JSON object and nothing else — no prose, no markdown fences. \
Use exactly these fields: \
title (string), summary (1-3 sentences), subject_matter (array of domain-level topic tags), \
entities (array of named entities mentioned), techniques (array of method/practice tags), \
tools (array of software/product tags), difficulty (one of beginner|intermediate|advanced), \
style (one of tutorial|analysis|discussion|demo|interview|news|review). \
Record tags exactly as the content presents them. Do NOT normalize, canonicalize, merge, \
or rephrase tags toward any preferred spelling.";

const PHASE2_SYSTEM: &str = "You consolidate content tags against a controlled vocabulary. \
You receive a metadata JSON object, the tags of semantically similar items that were already \
normalized, and the vocabulary's most frequent canonical forms. \
Rewrite each tag in subject_matter, techniques, and tools to a canonical form when one of the \
provided forms (or a close variant of one) matches its meaning. Invent a new canonical form \
(lowercase, hyphenated) only when no reasonable match exists. \
Preserve every field of the input object, including entities, difficulty, and style. \
Respond with a single JSON object of the same shape and nothing else.";

/// A semantic neighbor shown to Phase 2 as tagging context.
#[derive(Debug, Clone)]
pub struct NeighborContext {
    pub title: String,
    pub tags: Vec<String>,
}

/// Archive output type for a normalization at a vocabulary version.
pub fn normalized_output_type(vocab_version: &str) -> String {
    format!("normalized_metadata_{}", vocab_version)
}

/// Strip a markdown code fence wrapper, if present.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", …) up to the first newline.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse an LLM reply into metadata, leniently.
///
/// Fences are stripped, anything before the first `{` and after the last `}`
/// is ignored, list fields default to empty. A missing or empty title or
/// summary is an error — those two are required.
pub fn parse_metadata(reply: &str) -> Result<StructuredMetadata, String> {
    let stripped = strip_markdown_fences(reply);
    let start = stripped.find('{').ok_or("no JSON object in reply")?;
    let end = stripped.rfind('}').ok_or("no closing brace in reply")?;
    if end < start {
        return Err("no JSON object in reply".to_string());
    }

    let metadata: StructuredMetadata =
        serde_json::from_str(&stripped[start..=end]).map_err(|e| e.to_string())?;

    if metadata.title.trim().is_empty() {
        return Err("missing required field: title".to_string());
    }
    if metadata.summary.trim().is_empty() {
        return Err("missing required field: summary".to_string());
    }
    Ok(metadata)
}

/// Phase 1: raw structured extraction from source text.
///
/// Retries the call on unparseable output up to the configured attempt
/// budget; token usage accumulates across attempts so archived costs are
/// honest.
pub async fn extract_structured(
    llm_config: &LlmConfig,
    normalizer: &NormalizerConfig,
    raw_text: &str,
) -> Result<(StructuredMetadata, LlmUsage), NormalizeError> {
    let text = truncate_chars(raw_text, MAX_INPUT_CHARS);
    let user = format!("Extract metadata from this content:\n\n{}", text);
    let template_id = llm::prompt_id(PHASE1_SYSTEM);

    run_parse_loop(llm_config, normalizer, &template_id, PHASE1_SYSTEM, &user).await
}

/// Phase 2: vocabulary-aware normalization of a Phase-1 block.
pub async fn normalize_with_vocabulary(
    llm_config: &LlmConfig,
    normalizer: &NormalizerConfig,
    structured: &StructuredMetadata,
    neighbors: &[NeighborContext],
    vocab: &Vocabulary,
) -> Result<(StructuredMetadata, LlmUsage), NormalizeError> {
    let mut user = String::new();
    user.push_str("Metadata to normalize:\n");
    user.push_str(
        &serde_json::to_string_pretty(structured)
            .map_err(|e| NormalizeError::Malformed { attempts: 0, detail: e.to_string() })?,
    );

    if !neighbors.is_empty() {
        user.push_str("\n\nTags of semantically similar, already-normalized items:\n");
        for neighbor in neighbors {
            user.push_str(&format!(
                "- \"{}\": {}\n",
                neighbor.title,
                neighbor.tags.join(", ")
            ));
        }
    }

    let top = vocab.top_canonicals(normalizer.vocabulary_top_n);
    user.push_str(&format!(
        "\nCanonical vocabulary (version {}): {}\n",
        vocab.version,
        top.join(", ")
    ));

    let template_id = llm::prompt_id(PHASE2_SYSTEM);
    let (mut normalized, usage) =
        run_parse_loop(llm_config, normalizer, &template_id, PHASE2_SYSTEM, &user).await?;

    // The model was told to preserve fields; backfill the ones it dropped
    // anyway so the output schema stays complete.
    if normalized.entities.is_empty() {
        normalized.entities = structured.entities.clone();
    }
    if normalized.difficulty.is_none() {
        normalized.difficulty = structured.difficulty;
    }
    if normalized.style.is_none() {
        normalized.style = structured.style;
    }

    Ok((normalized, usage))
}

async fn run_parse_loop(
    llm_config: &LlmConfig,
    normalizer: &NormalizerConfig,
    template_id: &str,
    system: &str,
    user: &str,
) -> Result<(StructuredMetadata, LlmUsage), NormalizeError> {
    let mut total_usage = LlmUsage {
        model: llm_config.model.clone(),
        prompt_id: template_id.to_string(),
        ..Default::default()
    };
    let mut last_detail = String::new();

    for attempt in 1..=normalizer.max_parse_attempts {
        let response = llm::chat(llm_config, template_id, system, user).await?;
        total_usage.input_tokens += response.usage.input_tokens;
        total_usage.output_tokens += response.usage.output_tokens;
        total_usage.cost_usd += response.usage.cost_usd;
        total_usage.wall_ms += response.usage.wall_ms;

        match parse_metadata(&response.text) {
            Ok(metadata) => return Ok((metadata, total_usage)),
            Err(detail) => {
                warn!(attempt, %detail, "unparseable normalizer output, retrying");
                last_detail = detail;
            }
        }
    }

    Err(NormalizeError::Malformed {
        attempts: normalizer.max_parse_attempts,
        detail: last_detail,
    })
}

/// Tags of a normalized block that are absent from the vocabulary — the
/// canonical forms Phase 2 invented.
pub fn tentative_tags(metadata: &StructuredMetadata, vocab: &Vocabulary) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in metadata.vocabulary_tags() {
        if vocab.canonical_of(tag).is_none() {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() && !out.contains(&tag) {
                out.push(tag);
            }
        }
    }
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut idx = max_chars;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    &text[..idx]
}
