//! Ingestion controller.
//!
//! Drives the queue through the full pipeline:
//!
//! ```text
//! queued → fetched → archived_source → chunked → embedded_chunks
//!        → embedded_global → tagged_phase1 → tagged_phase2
//!        → upserted → done
//! ```
//!
//! One logical worker processes one item end-to-end at a time. Every retry
//! happens at the queue boundary — a retryable failure rewrites the item
//! into `pending` with a bumped attempt counter; nothing recurses in
//! process. Terminal failures complete the item with a failure record. The
//! archive is written before any derived store, so a crash at any stage
//! loses no expensive work: re-running the item resumes from whatever the
//! archive already holds (source text, Phase-1 output, normalization at the
//! active vocabulary version).
//!
//! Rate limiting is enforced here, before the fetch: YouTube items pass a
//! per-class rolling window unless a rotating proxy is configured. A 429
//! from the source still requeues the item like any retryable failure.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::archive::{Archive, ProcessingRecord};
use crate::chunk::{self, TextChunk};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::{classify, Disposition, NormalizeError};
use crate::fetch_web;
use crate::fetch_youtube;
use crate::models::{
    chunk_id, ChunkRecord, ContentKind, ContentRecord, Provenance, StructuredDocument,
    StructuredMetadata, TranscriptSegment,
};
use crate::normalize::{self, NeighborContext};
use crate::queue::{Queue, RateLimiter, WorkItem};
use crate::vector_store::{PayloadFilter, SqliteIndex, VectorIndex};
use crate::vocab::VocabStore;

pub const CODE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pipeline states, recorded on the processing record as the furthest stage
/// an attempt reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Queued,
    Fetched,
    ArchivedSource,
    Chunked,
    EmbeddedChunks,
    EmbeddedGlobal,
    TaggedPhase1,
    TaggedPhase2,
    Upserted,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Fetched => "fetched",
            Stage::ArchivedSource => "archived_source",
            Stage::Chunked => "chunked",
            Stage::EmbeddedChunks => "embedded_chunks",
            Stage::EmbeddedGlobal => "embedded_global",
            Stage::TaggedPhase1 => "tagged_phase1",
            Stage::TaggedPhase2 => "tagged_phase2",
            Stage::Upserted => "upserted",
            Stage::Done => "done",
        }
    }
}

/// Derive the stable content id and kind from a work-item URL.
pub fn derive_content_id(url: &str) -> Result<(String, ContentKind)> {
    if url.contains("youtube.com") || url.contains("youtu.be") {
        let video_id = fetch_youtube::video_id_from_url(url)?;
        Ok((format!("youtube:{}", video_id), ContentKind::YoutubeVideo))
    } else {
        let (id, _domain) = fetch_web::web_content_id(url)?;
        Ok((id, ContentKind::WebArticle))
    }
}

/// Run the queue worker until the queue drains (`once`) or until
/// interrupted.
pub async fn run_worker(config: &Config, once: bool, limit: Option<usize>) -> Result<()> {
    let queue = Queue::new(&config.queue.root);
    let recovered = queue.recover()?;
    if recovered > 0 {
        info!(recovered, "moved interrupted items back to pending");
    }

    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;
    let index = SqliteIndex::new(pool);
    let archive = Archive::new(&config.archive.root);
    let vocab_store = VocabStore::new(&config.archive.root);
    let mut limiter = RateLimiter::new(&config.rate_limit.youtube, config.proxy.url.is_some());

    // Ctrl-C flips the flag; the worker finishes the in-flight call and
    // exits at the next stage boundary.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut processed = 0usize;

    'outer: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if let Some(max) = limit {
            if processed >= max {
                break;
            }
        }

        let pending = queue.list_pending()?;
        if pending.is_empty() {
            if once {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            continue;
        }

        for path in pending {
            if *shutdown_rx.borrow() {
                break 'outer;
            }
            if let Some(max) = limit {
                if processed >= max {
                    break 'outer;
                }
            }

            let (processing_path, item) = match queue.claim(&path) {
                Ok(claimed) => claimed,
                Err(e) => {
                    // Another reason the file vanished (manual edit, crash
                    // cleanup); skip it.
                    warn!(path = %path.display(), error = %e, "could not claim work item");
                    continue;
                }
            };
            processed += 1;

            // Admission: YouTube fetches pass the rolling window first.
            let is_youtube = item.url.contains("youtube.com") || item.url.contains("youtu.be");
            if is_youtube {
                loop {
                    if limiter.admit(item.class) {
                        break;
                    }
                    let wait = limiter
                        .wait(item.class)
                        .unwrap_or(std::time::Duration::from_secs(1));
                    info!(url = %item.url, wait_secs = wait.as_secs(), "rate window full, waiting");
                    let mut rx = shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = rx.changed() => {}
                    }
                    if *shutdown_rx.borrow() {
                        // Clean shutdown: the item goes back untouched.
                        queue.release(&processing_path)?;
                        if let Ok((id, _)) = derive_content_id(&item.url) {
                            append_record(
                                config,
                                &archive,
                                &vocab_store,
                                &id,
                                "interrupted",
                                Stage::Queued,
                                None,
                            );
                        }
                        info!(url = %item.url, "interrupted while waiting for rate window");
                        break 'outer;
                    }
                }
            }

            let mut stage = Stage::Queued;
            match process_item(config, &archive, &vocab_store, &index, &item, &mut stage).await {
                Ok(content_id) => {
                    append_record(config, &archive, &vocab_store, &content_id, "ok", stage, None);
                    queue.complete(&processing_path)?;
                    info!(content_id, stage = stage.as_str(), "item ingested");
                }
                Err(err) => {
                    let content_id = derive_content_id(&item.url).map(|(id, _)| id).ok();
                    let disposition = classify(&err);
                    let attempts = item.attempts + 1;
                    let escalated = disposition == Disposition::Retryable
                        && attempts >= config.ingest.max_attempts;

                    if disposition == Disposition::Terminal || escalated {
                        if let Some(id) = &content_id {
                            append_record(
                                config,
                                &archive,
                                &vocab_store,
                                id,
                                "failed",
                                stage,
                                Some(err.to_string()),
                            );
                        }
                        warn!(url = %item.url, stage = stage.as_str(), attempts,
                              error = %err, "item failed terminally");
                        queue.complete(&processing_path)?;
                    } else {
                        warn!(url = %item.url, stage = stage.as_str(), attempts,
                              error = %err, "retryable failure, requeueing");
                        queue.requeue(&processing_path, &item)?;
                        tokio::time::sleep(std::time::Duration::from_secs(
                            config.ingest.retry_delay_secs.min(5),
                        ))
                        .await;
                    }
                }
            }
        }

        if once && queue.list_pending()?.is_empty() {
            break;
        }
    }

    if *shutdown_rx.borrow() {
        info!("worker interrupted, exiting cleanly");
    }
    index.pool().close().await;
    Ok(())
}

/// One item through the pipeline. `stage` tracks the furthest state reached
/// so failures can be recorded precisely.
async fn process_item(
    config: &Config,
    archive: &Archive,
    vocab_store: &VocabStore,
    index: &SqliteIndex,
    item: &WorkItem,
    stage: &mut Stage,
) -> Result<String> {
    let (content_id, kind) = derive_content_id(&item.url)?;
    let active_vocab = vocab_store.active_version()?;

    // Idempotency probe: a successful record at the current code+vocabulary
    // versions with both collections populated means no work and no
    // external calls.
    if let Some(vocab_version) = &active_vocab {
        if archive.processed_ok_at(&content_id, CODE_VERSION, vocab_version)?
            && !index.fetch_content(&[content_id.clone()]).await?.is_empty()
            && !index.fetch_chunks(&content_id).await?.is_empty()
        {
            *stage = Stage::Done;
            info!(content_id, "already processed at current versions, skipping");
            return Ok(content_id);
        }
    }

    // Fetch, unless the archive already holds the source.
    let record = match archive.load(&content_id)? {
        Some(existing) => {
            *stage = Stage::ArchivedSource;
            existing
        }
        None => {
            let (raw_text, raw_metadata, source) = match kind {
                ContentKind::YoutubeVideo => {
                    let (segments, info) =
                        fetch_youtube::fetch_transcript(&config.fetcher, &config.proxy, &item.url)
                            .await?;
                    let raw_text = chunk::join_transcript(&segments);
                    let raw_metadata = serde_json::json!({
                        "video": info,
                        "segments": segments,
                    });
                    let source = info.channel.clone();
                    (raw_text, raw_metadata, source)
                }
                ContentKind::WebArticle => {
                    let (doc, linearized) =
                        fetch_web::fetch_page(&config.fetcher, &config.proxy, &item.url).await?;
                    let (_, domain) = fetch_web::web_content_id(&item.url)?;
                    let raw_metadata = serde_json::json!({
                        "title": doc.title,
                        "blocks": doc.blocks,
                    });
                    (linearized, raw_metadata, domain)
                }
            };
            *stage = Stage::Fetched;

            archive.write_source(
                &content_id,
                kind,
                &raw_text,
                raw_metadata,
                Provenance {
                    url: item.url.clone(),
                    source,
                    fetched_at: Utc::now(),
                },
                false,
            )?;
            *stage = Stage::ArchivedSource;
            archive
                .load(&content_id)?
                .context("archive record vanished after write")?
        }
    };

    let chunks = chunks_from_record(config, &record)?;
    if chunks.is_empty() {
        bail!("no chunks produced for {}", content_id);
    }
    *stage = Stage::Chunked;

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let chunk_vectors = embed_chunk_texts(config, &texts).await?;
    *stage = Stage::EmbeddedChunks;

    let global_embedding =
        embedding::embed_global(&config.embedder.global, &record.raw_text).await?;
    *stage = Stage::EmbeddedGlobal;

    // Phase 1, reusing any archived extraction.
    let structured = phase1(config, archive, &content_id, &record.raw_text).await?;
    *stage = Stage::TaggedPhase1;

    // Phase 2 requires an active vocabulary.
    let (normalized, vocab_version) = phase2(
        config,
        archive,
        vocab_store,
        index,
        &content_id,
        &structured,
        &global_embedding,
    )
    .await?;
    *stage = Stage::TaggedPhase2;

    let (content_record, chunk_records) = build_records(
        &record,
        &normalized,
        &vocab_version,
        &chunks,
        chunk_vectors,
        global_embedding,
        item.rating,
        item.importance.clone(),
        &item.projects,
    );
    // Chunks first: a failure between the two upserts leaves a mismatch the
    // next ingestion pass repairs from the archive.
    index.upsert_chunks(&content_id, &chunk_records).await?;
    index.upsert_content(&content_record).await?;
    *stage = Stage::Upserted;

    *stage = Stage::Done;
    Ok(content_id)
}

/// Embed chunk texts in provider-sized batches.
pub async fn embed_chunk_texts(config: &Config, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(config.embedder.chunk.batch_size) {
        vectors.extend(embedding::embed_texts(&config.embedder.chunk, batch).await?);
    }
    Ok(vectors)
}

/// Assemble the index records for one item from its parts.
#[allow(clippy::too_many_arguments)]
pub fn build_records(
    record: &crate::archive::ArchiveRecord,
    normalized: &StructuredMetadata,
    vocab_version: &str,
    chunks: &[TextChunk],
    chunk_vectors: Vec<Vec<f32>>,
    global_embedding: Vec<f32>,
    rating: Option<f64>,
    importance: Option<String>,
    projects: &[String],
) -> (ContentRecord, Vec<ChunkRecord>) {
    let mut tags: Vec<String> = Vec::new();
    for tag in normalized.vocabulary_tags() {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    let title = if normalized.title.trim().is_empty() {
        record.id.clone()
    } else {
        normalized.title.clone()
    };

    let chunk_records: Vec<ChunkRecord> = chunks
        .iter()
        .zip(chunk_vectors)
        .map(|(c, embedding)| ChunkRecord {
            id: chunk_id(&record.id, c.index),
            doc_id: record.id.clone(),
            kind: record.kind.chunk_kind().to_string(),
            title: title.clone(),
            source: record.provenance.source.clone(),
            url: record.provenance.url.clone(),
            chunk_index: c.index,
            text: c.text.clone(),
            start_char: c.start_char as i64,
            end_char: c.end_char as i64,
            start_time: c.start_time,
            end_time: c.end_time,
            local_summary: None,
            tags: tags.clone(),
            projects: projects.to_vec(),
            embedding,
        })
        .collect();

    let content_record = ContentRecord {
        id: record.id.clone(),
        kind: record.kind,
        title,
        source: record.provenance.source.clone(),
        url: record.provenance.url.clone(),
        summary: normalized.summary.clone(),
        tags,
        created_at: record.provenance.fetched_at.timestamp(),
        rating,
        importance,
        projects: projects.to_vec(),
        raw_metadata: serde_json::to_value(normalized).unwrap_or_default(),
        vocab_version: vocab_version.to_string(),
        embedding: global_embedding,
    };

    (content_record, chunk_records)
}

/// Phase 1: reuse the archived extraction or run it.
pub async fn phase1(
    config: &Config,
    archive: &Archive,
    content_id: &str,
    raw_text: &str,
) -> Result<StructuredMetadata> {
    if let Some(value) = archive.read_latest(content_id, "structured_metadata")? {
        if let Ok(metadata) = serde_json::from_value::<StructuredMetadata>(value) {
            if !metadata.title.trim().is_empty() {
                return Ok(metadata);
            }
        }
    }

    let (metadata, usage) =
        normalize::extract_structured(&config.llm, &config.normalizer, raw_text).await?;
    archive.append_llm_output(
        content_id,
        "structured_metadata",
        None,
        serde_json::to_value(&metadata)?,
        &usage,
    )?;
    Ok(metadata)
}

/// Phase 2 at the active vocabulary version, reusing an archived result when
/// one exists for that version. Returns the normalized block and the
/// version it was normalized against.
pub async fn phase2(
    config: &Config,
    archive: &Archive,
    vocab_store: &VocabStore,
    index: &dyn VectorIndex,
    content_id: &str,
    structured: &StructuredMetadata,
    global_embedding: &[f32],
) -> Result<(StructuredMetadata, String)> {
    let vocab = vocab_store
        .load_active()?
        .ok_or(NormalizeError::VocabularyMissing)?;
    let output_type = normalize::normalized_output_type(&vocab.version);

    if let Some(value) = archive.read_latest(content_id, &output_type)? {
        if let Ok(metadata) = serde_json::from_value::<StructuredMetadata>(value) {
            if !metadata.title.trim().is_empty() {
                return Ok((metadata, vocab.version));
            }
        }
    }

    // Semantic neighbors: similar items already normalized at this version.
    let neighbor_filter = PayloadFilter {
        vocab_version: Some(vocab.version.clone()),
        ..Default::default()
    };
    let neighbors: Vec<NeighborContext> = match index
        .search_content(
            global_embedding,
            config.normalizer.neighbors_k + 1,
            &neighbor_filter,
        )
        .await
    {
        Ok(hits) => hits
            .into_iter()
            .filter(|h| h.record.id != content_id)
            .take(config.normalizer.neighbors_k)
            .map(|h| NeighborContext {
                title: h.record.title,
                tags: h.record.tags,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "neighbor lookup failed; normalizing without context");
            Vec::new()
        }
    };

    let (normalized, usage) = normalize::normalize_with_vocabulary(
        &config.llm,
        &config.normalizer,
        structured,
        &neighbors,
        &vocab,
    )
    .await?;

    archive.append_llm_output(
        content_id,
        &output_type,
        Some(&vocab.version),
        serde_json::to_value(&normalized)?,
        &usage,
    )?;

    let tentative = normalize::tentative_tags(&normalized, &vocab);
    if !tentative.is_empty() {
        vocab_store.record_tentative(&tentative)?;
    }

    Ok((normalized, vocab.version))
}

/// Rebuild the chunk list of an archived item from its stored structure.
pub fn chunks_from_record(
    config: &Config,
    record: &crate::archive::ArchiveRecord,
) -> Result<Vec<TextChunk>> {
    match record.kind {
        ContentKind::YoutubeVideo => {
            let segments: Vec<TranscriptSegment> = serde_json::from_value(
                record
                    .raw_metadata
                    .get("segments")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            )
            .with_context(|| format!("archived segments missing for {}", record.id))?;
            Ok(chunk::chunk_transcript(&segments, &config.chunker.transcript))
        }
        ContentKind::WebArticle => {
            let blocks = serde_json::from_value(
                record
                    .raw_metadata
                    .get("blocks")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            )
            .with_context(|| format!("archived blocks missing for {}", record.id))?;
            let doc = StructuredDocument {
                title: record
                    .raw_metadata
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(str::to_string),
                blocks,
            };
            Ok(chunk::chunk_web(&doc, &config.chunker.web))
        }
    }
}

/// Chunk, embed, and upsert one item's derived representation into both
/// collections. `global_embedding` is reused when the caller already has it.
#[allow(clippy::too_many_arguments)]
pub async fn index_item(
    config: &Config,
    index: &dyn VectorIndex,
    record: &crate::archive::ArchiveRecord,
    normalized: &StructuredMetadata,
    vocab_version: &str,
    global_embedding: Option<Vec<f32>>,
    rating: Option<f64>,
    importance: Option<String>,
    projects: &[String],
) -> Result<()> {
    let chunks = chunks_from_record(config, record)?;
    if chunks.is_empty() {
        bail!("no chunks produced for {}", record.id);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let chunk_vectors = embed_chunk_texts(config, &texts).await?;

    let global = match global_embedding {
        Some(v) => v,
        None => embedding::embed_global(&config.embedder.global, &record.raw_text).await?,
    };

    let (content_record, chunk_records) = build_records(
        record,
        normalized,
        vocab_version,
        &chunks,
        chunk_vectors,
        global,
        rating,
        importance,
        projects,
    );

    // Chunks first: a failure between the two upserts leaves a mismatch the
    // next ingestion pass repairs from the archive.
    index.upsert_chunks(&record.id, &chunk_records).await?;
    index.upsert_content(&content_record).await?;
    Ok(())
}

/// Phase-2-only re-normalization against the active vocabulary.
///
/// Runs on archived items: no fetch and no Phase-1 call. Items already
/// normalized at the active version are skipped unless `force`.
pub async fn run_renormalize(
    config: &Config,
    target: Option<&str>,
    force: bool,
) -> Result<()> {
    let archive = Archive::new(&config.archive.root);
    let vocab_store = VocabStore::new(&config.archive.root);
    let vocab = vocab_store
        .load_active()?
        .ok_or(NormalizeError::VocabularyMissing)?;
    let output_type = normalize::normalized_output_type(&vocab.version);

    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;
    let index = SqliteIndex::new(pool);

    let ids: Vec<String> = match target {
        Some(id) => vec![id.to_string()],
        None => archive.iterate(Default::default()).collect(),
    };

    let mut updated = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for content_id in ids {
        let record = match archive.load(&content_id)? {
            Some(r) => r,
            None => {
                warn!(content_id, "no archive record, skipping");
                continue;
            }
        };

        if !force && archive.read_latest(&content_id, &output_type)?.is_some() {
            skipped += 1;
            continue;
        }

        let structured = match archive.read_latest(&content_id, "structured_metadata")? {
            Some(value) => match serde_json::from_value::<StructuredMetadata>(value) {
                Ok(m) => m,
                Err(e) => {
                    warn!(content_id, error = %e, "unreadable structured metadata, skipping");
                    failed += 1;
                    continue;
                }
            },
            None => {
                warn!(content_id, "no structured metadata; run a full ingest first");
                failed += 1;
                continue;
            }
        };

        let result = async {
            let global =
                embedding::embed_global(&config.embedder.global, &record.raw_text).await?;
            let (normalized, vocab_version) = phase2(
                config,
                &archive,
                &vocab_store,
                &index,
                &content_id,
                &structured,
                &global,
            )
            .await?;

            // Carry the existing user context forward.
            let existing = index.fetch_content(&[content_id.clone()]).await?;
            let (rating, importance, projects) = existing
                .into_iter()
                .next()
                .map(|r| (r.rating, r.importance, r.projects))
                .unwrap_or((None, None, Vec::new()));

            index_item(
                config,
                &index,
                &record,
                &normalized,
                &vocab_version,
                Some(global),
                rating,
                importance,
                &projects,
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                updated += 1;
                info!(content_id, version = %vocab.version, "re-normalized");
            }
            Err(e) => {
                failed += 1;
                warn!(content_id, error = %e, "re-normalization failed");
            }
        }
    }

    println!("renormalize at {}", vocab.version);
    println!("  updated: {}", updated);
    println!("  skipped (already at version): {}", skipped);
    println!("  failed: {}", failed);

    index.pool().close().await;
    Ok(())
}

fn append_record(
    config: &Config,
    archive: &Archive,
    vocab_store: &VocabStore,
    content_id: &str,
    status: &str,
    stage: Stage,
    error: Option<String>,
) {
    let vocab_version = vocab_store
        .active_version()
        .ok()
        .flatten()
        .unwrap_or_default();
    let entry = ProcessingRecord {
        at: Utc::now(),
        code_version: CODE_VERSION.to_string(),
        vocab_version,
        embedder_model: Some(config.embedder.chunk.model.clone()),
        status: status.to_string(),
        stage: stage.as_str().to_string(),
        error,
    };
    if let Err(e) = archive.append_processing_record(content_id, entry) {
        // An item that failed before its source was archived has nowhere to
        // put the record; the tracing log is the only trace, by design.
        warn!(content_id, error = %e, "could not append processing record");
    }
}
