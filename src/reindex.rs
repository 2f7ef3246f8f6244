//! Rebuild the vector index from the archive alone.
//!
//! The archive is the single source of truth; both collections are derived
//! and can always be reconstructed from it. For every archived item the
//! newest normalized metadata (falling back to the Phase-1 extraction) is
//! re-chunked, re-embedded, and upserted. User context already in the index
//! (rating, importance, projects) is carried forward.

use anyhow::Result;
use tracing::{info, warn};

use crate::archive::{Archive, ArchiveRecord};
use crate::config::Config;
use crate::db;
use crate::ingest;
use crate::models::StructuredMetadata;
use crate::vector_store::{SqliteIndex, VectorIndex};

/// Newest normalized metadata on a record: highest vocabulary version, then
/// highest attempt; Phase-1 output as fallback.
pub fn latest_metadata(record: &ArchiveRecord) -> Option<(StructuredMetadata, String)> {
    let mut best: Option<(u64, u32, &serde_json::Value, String)> = None;
    for output in &record.llm_outputs {
        let Some(version) = output.output_type.strip_prefix("normalized_metadata_v") else {
            continue;
        };
        let Ok(version_num) = version.parse::<u64>() else {
            continue;
        };
        let better = match &best {
            Some((v, a, _, _)) => (version_num, output.attempt) > (*v, *a),
            None => true,
        };
        if better {
            best = Some((
                version_num,
                output.attempt,
                &output.value,
                format!("v{}", version_num),
            ));
        }
    }

    if let Some((_, _, value, version)) = best {
        if let Ok(metadata) = serde_json::from_value::<StructuredMetadata>(value.clone()) {
            return Some((metadata, version));
        }
    }

    // Fall back to the raw extraction; tags are then un-normalized and the
    // record carries no vocabulary version.
    record
        .llm_outputs
        .iter()
        .filter(|o| o.output_type == "structured_metadata")
        .max_by_key(|o| o.attempt)
        .and_then(|o| serde_json::from_value::<StructuredMetadata>(o.value.clone()).ok())
        .map(|m| (m, String::new()))
}

pub async fn run_reindex(config: &Config) -> Result<()> {
    let archive = Archive::new(&config.archive.root);
    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;
    let index = SqliteIndex::new(pool);

    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for content_id in archive.iterate(Default::default()) {
        let record = match archive.load(&content_id)? {
            Some(r) => r,
            None => continue,
        };
        if record.raw_text.trim().is_empty() {
            skipped += 1;
            continue;
        }

        let Some((metadata, vocab_version)) = latest_metadata(&record) else {
            warn!(content_id, "no archived metadata, skipping");
            skipped += 1;
            continue;
        };

        // Keep whatever user context the index already holds.
        let existing = index.fetch_content(&[content_id.clone()]).await?;
        let (rating, importance, projects) = existing
            .into_iter()
            .next()
            .map(|r| (r.rating, r.importance, r.projects))
            .unwrap_or((None, None, Vec::new()));

        match ingest::index_item(
            config,
            &index,
            &record,
            &metadata,
            &vocab_version,
            None,
            rating,
            importance,
            &projects,
        )
        .await
        {
            Ok(()) => {
                indexed += 1;
                info!(content_id, "re-indexed");
            }
            Err(e) => {
                failed += 1;
                warn!(content_id, error = %e, "re-index failed");
            }
        }
    }

    println!("reindex");
    println!("  indexed: {}", indexed);
    println!("  skipped: {}", skipped);
    println!("  failed: {}", failed);

    index.pool().close().await;
    Ok(())
}
