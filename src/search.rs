//! Query engine with mode-dependent multi-signal ranking.
//!
//! One public operation: [`query`]. The query text is embedded with both the
//! chunk and the global model, chunk candidates are retrieved and grouped by
//! document, and each candidate document is scored as
//!
//! ```text
//! score = w_chunk·chunk + w_global·global + w_persona·persona + w_pref·pref
//! ```
//!
//! with weights chosen by mode (`search` leans on chunk similarity,
//! `recommendation` on persona and preference history, `application` sits in
//! between). All component scores are clamped to `[-1, 1]` before weighting;
//! weights sum to 1; ordering is stable with ties broken by ascending
//! document id.
//!
//! Degradation is graceful: a failing chunk search yields an empty ranked
//! list, a missing persona contributes zero, and a chunk whose parent
//! content record is missing is ranked from its denormalized payload rather
//! than dropped.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::config::{Config, WeightSet};
use crate::embedding;
use crate::models::ContentKind;
use crate::persona::Persona;
use crate::pref::pref_score;
use crate::vector_store::{ChunkHit, PayloadFilter, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Search,
    Recommendation,
    Application,
}

impl QueryMode {
    pub fn parse(s: &str) -> Result<QueryMode> {
        match s {
            "search" => Ok(QueryMode::Search),
            "recommendation" => Ok(QueryMode::Recommendation),
            "application" => Ok(QueryMode::Application),
            other => bail!(
                "Unknown query mode: {}. Use search, recommendation, or application.",
                other
            ),
        }
    }

    pub fn weights(&self, config: &Config) -> WeightSet {
        match self {
            QueryMode::Search => config.ranker.weights.search,
            QueryMode::Recommendation => config.ranker.weights.recommendation,
            QueryMode::Application => config.ranker.weights.application,
        }
    }
}

/// Payload filters accepted at query time.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub kind: Option<String>,
    pub source: Option<String>,
    pub project: Option<String>,
}

impl QueryFilters {
    fn to_payload(&self) -> PayloadFilter {
        PayloadFilter {
            kind: self.kind.clone(),
            source: self.source.clone(),
            project: self.project.clone(),
            vocab_version: None,
        }
    }
}

/// Preview of a top-scoring chunk, for display and jump-to-timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPreview {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub score: f64,
    pub excerpt: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

/// One ranked document with its component scores.
#[derive(Debug, Clone, Serialize)]
pub struct RankedDoc {
    pub doc_id: String,
    pub title: String,
    pub kind: String,
    pub source: String,
    pub url: String,
    pub summary: String,
    pub score: f64,
    pub chunk_score: f64,
    pub global_score: f64,
    pub persona_score: f64,
    pub pref_score: f64,
    pub top_chunks: Vec<ChunkPreview>,
}

/// Combine component scores under a weight set, clamping each to `[-1, 1]`.
pub fn combine(weights: &WeightSet, chunk: f64, global: f64, persona: f64, pref: f64) -> f64 {
    let clamp = |x: f64| x.clamp(-1.0, 1.0);
    weights.chunk * clamp(chunk)
        + weights.global * clamp(global)
        + weights.persona * clamp(persona)
        + weights.pref * clamp(pref)
}

/// Blend persona similarity for one document embedding.
///
/// Weighted mean of cosine similarities over the blend; an empty blend (or
/// one with zero total weight) contributes nothing.
pub fn persona_similarity(blend: &[(Persona, f64)], doc_embedding: &[f32]) -> f64 {
    let total: f64 = blend.iter().map(|(_, w)| w).sum();
    if blend.is_empty() || total <= 0.0 {
        return 0.0;
    }
    blend
        .iter()
        .map(|(p, w)| {
            embedding::cosine_similarity(&p.vector, doc_embedding) as f64 * (w / total)
        })
        .sum()
}

/// Run a ranked query against the index.
pub async fn query(
    config: &Config,
    index: &dyn VectorIndex,
    persona_blend: &[(Persona, f64)],
    text: &str,
    mode: QueryMode,
    filters: &QueryFilters,
    k: Option<usize>,
) -> Result<Vec<RankedDoc>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    // An empty index needs no query embedding; this also keeps retrieval
    // usable before any provider is reachable.
    if index.count_content().await.unwrap_or(0) == 0 {
        return Ok(Vec::new());
    }

    let q_chunk = embedding::embed_query(&config.embedder.chunk, text).await?;
    let q_global = embedding::embed_query(&config.embedder.global, text).await?;

    let payload_filter = filters.to_payload();
    let chunk_hits = match index
        .search_chunks(&q_chunk, config.ranker.candidate_chunks, &payload_filter)
        .await
    {
        Ok(hits) => hits,
        Err(e) => {
            warn!(error = %e, "chunk search failed; returning empty result");
            return Ok(Vec::new());
        }
    };
    if chunk_hits.is_empty() {
        return Ok(Vec::new());
    }

    // Group chunk hits by parent document; keep each doc's best chunks.
    let mut by_doc: HashMap<String, Vec<ChunkHit>> = HashMap::new();
    for hit in chunk_hits {
        by_doc.entry(hit.record.doc_id.clone()).or_default().push(hit);
    }

    let doc_ids: Vec<String> = by_doc.keys().cloned().collect();
    let content_records = index.fetch_content(&doc_ids).await?;
    let content_by_id: HashMap<&str, &crate::models::ContentRecord> =
        content_records.iter().map(|r| (r.id.as_str(), r)).collect();

    let weights = mode.weights(config);
    let now = Utc::now();
    let mut ranked = Vec::with_capacity(by_doc.len());

    for (doc_id, mut hits) in by_doc {
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.chunk_index.cmp(&b.record.chunk_index))
        });
        let chunk_score = hits.first().map(|h| h.score as f64).unwrap_or(0.0);

        let (title, kind, source, url, summary, global_score, persona, pref) =
            match content_by_id.get(doc_id.as_str()) {
                Some(record) => (
                    record.title.clone(),
                    record.kind.as_str().to_string(),
                    record.source.clone(),
                    record.url.clone(),
                    record.summary.clone(),
                    embedding::cosine_similarity(&q_global, &record.embedding) as f64,
                    persona_similarity(persona_blend, &record.embedding),
                    pref_score(record.rating, record.created_at, &record.projects, now),
                ),
                // Content row missing (index lagging the archive): rank from
                // the chunk payload rather than dropping the candidate.
                None => {
                    let first = &hits[0].record;
                    (
                        first.title.clone(),
                        ContentKind::of_content_id(&doc_id)
                            .map(|c| c.as_str().to_string())
                            .unwrap_or_else(|| first.kind.clone()),
                        first.source.clone(),
                        first.url.clone(),
                        String::new(),
                        0.0,
                        0.0,
                        pref_score(None, now.timestamp(), &first.projects, now),
                    )
                }
            };

        let score = combine(&weights, chunk_score, global_score, persona, pref);
        let top_chunks = hits
            .iter()
            .take(config.ranker.top_chunks_per_doc)
            .map(|h| ChunkPreview {
                chunk_id: h.record.id.clone(),
                chunk_index: h.record.chunk_index,
                score: h.score as f64,
                excerpt: excerpt(&h.record.text),
                start_time: h.record.start_time,
                end_time: h.record.end_time,
            })
            .collect();

        ranked.push(RankedDoc {
            doc_id,
            title,
            kind,
            source,
            url,
            summary,
            score,
            chunk_score,
            global_score,
            persona_score: persona,
            pref_score: pref,
            top_chunks,
        });
    }

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    ranked.truncate(k.unwrap_or(config.ranker.final_limit));

    Ok(ranked)
}

fn excerpt(text: &str) -> String {
    let mut end = text.len().min(240);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
