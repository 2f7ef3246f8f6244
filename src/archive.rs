//! Append-only content archive.
//!
//! One immutable JSON record per content item, laid out as
//! `<root>/<kind>/<YYYY-MM>/<content_id>.json`. Web-article ids contain a
//! `/` (`web:<domain>/<slug>`), which would nest a directory inside the
//! month, so ids are percent-encoded into the flat filename (`%` → `%25`,
//! `/` → `%2F`) and decoded on iteration. The archive holds everything
//! expensive or irreproducible: raw fetched text, every LLM output with its
//! usage and cost, and one processing record per ingestion attempt. All
//! derived stores (the vector index) can be rebuilt from it.
//!
//! Writes are atomic per file: content goes to a sibling `.tmp` file which is
//! renamed into place. A file that fails to parse is treated as absent — a
//! crashed writer leaves either the previous complete record or nothing.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::ArchiveError;
use crate::models::{ContentKind, LlmUsage, Provenance};

/// The on-disk record for one content item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: String,
    pub kind: ContentKind,
    pub provenance: Provenance,
    /// Verbatim transcript or linearized page text.
    pub raw_text: String,
    /// Title, channel, duration and other fetch-time metadata.
    #[serde(default)]
    pub raw_metadata: serde_json::Value,
    #[serde(default)]
    pub llm_outputs: Vec<LlmOutputEntry>,
    #[serde(default)]
    pub processing_records: Vec<ProcessingRecord>,
}

/// One archived LLM result. Attempts for the same `output_type` are ordered
/// by `attempt`, never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmOutputEntry {
    /// `structured_metadata`, `normalized_metadata_v<version>`, …
    pub output_type: String,
    pub attempt: u32,
    #[serde(default)]
    pub vocabulary_version: Option<String>,
    pub model: String,
    pub prompt_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub wall_ms: u64,
    pub value: serde_json::Value,
}

/// One record per ingestion attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub at: DateTime<Utc>,
    pub code_version: String,
    pub vocab_version: String,
    /// Embedding model the item's vectors were produced with; a changed
    /// model marks the stored vectors stale.
    #[serde(default)]
    pub embedder_model: Option<String>,
    /// `ok`, `failed`, or `interrupted`.
    pub status: String,
    /// Furthest pipeline stage reached in this attempt.
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Filter for [`Archive::iterate`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    pub kind: Option<ContentKind>,
    /// `YYYY-MM` month directory.
    pub month: Option<String>,
}

/// Aggregate cost and token usage computed by iterating the archive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub records: u64,
    pub llm_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the raw source record for a content item.
    ///
    /// Fails with [`ArchiveError::AlreadyWritten`] if a source record already
    /// exists, unless `overwrite` is set. Existing LLM outputs and processing
    /// records are preserved on overwrite.
    pub fn write_source(
        &self,
        content_id: &str,
        kind: ContentKind,
        raw_text: &str,
        raw_metadata: serde_json::Value,
        provenance: Provenance,
        overwrite: bool,
    ) -> Result<(), ArchiveError> {
        let existing = self.load(content_id)?;
        if existing.is_some() && !overwrite {
            return Err(ArchiveError::AlreadyWritten {
                content_id: content_id.to_string(),
            });
        }

        let record = ArchiveRecord {
            id: content_id.to_string(),
            kind,
            raw_text: raw_text.to_string(),
            raw_metadata,
            llm_outputs: existing
                .as_ref()
                .map(|r| r.llm_outputs.clone())
                .unwrap_or_default(),
            processing_records: existing
                .map(|r| r.processing_records)
                .unwrap_or_default(),
            provenance,
        };

        let path = self.path_for(&record);
        self.save(&path, &record)
    }

    /// Append an LLM output under the next attempt ordinal for its type.
    pub fn append_llm_output(
        &self,
        content_id: &str,
        output_type: &str,
        vocabulary_version: Option<&str>,
        value: serde_json::Value,
        usage: &LlmUsage,
    ) -> Result<u32, ArchiveError> {
        let mut record = self
            .load(content_id)?
            .ok_or_else(|| ArchiveError::NotFound(content_id.to_string()))?;

        let attempt = 1 + record
            .llm_outputs
            .iter()
            .filter(|o| o.output_type == output_type)
            .map(|o| o.attempt)
            .max()
            .unwrap_or(0);

        record.llm_outputs.push(LlmOutputEntry {
            output_type: output_type.to_string(),
            attempt,
            vocabulary_version: vocabulary_version.map(str::to_string),
            model: usage.model.clone(),
            prompt_id: usage.prompt_id.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: usage.cost_usd,
            wall_ms: usage.wall_ms,
            value,
        });

        let path = self.path_for(&record);
        self.save(&path, &record)?;
        Ok(attempt)
    }

    /// Append one processing record for an ingestion attempt.
    pub fn append_processing_record(
        &self,
        content_id: &str,
        record_entry: ProcessingRecord,
    ) -> Result<(), ArchiveError> {
        let mut record = self
            .load(content_id)?
            .ok_or_else(|| ArchiveError::NotFound(content_id.to_string()))?;
        record.processing_records.push(record_entry);
        let path = self.path_for(&record);
        self.save(&path, &record)
    }

    /// Read the verbatim source text of a content item.
    pub fn read_source(&self, content_id: &str) -> Result<String, ArchiveError> {
        self.load(content_id)?
            .map(|r| r.raw_text)
            .ok_or_else(|| ArchiveError::NotFound(content_id.to_string()))
    }

    /// Read the highest-attempt value of an output type, if any.
    pub fn read_latest(
        &self,
        content_id: &str,
        output_type: &str,
    ) -> Result<Option<serde_json::Value>, ArchiveError> {
        let record = match self.load(content_id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        Ok(record
            .llm_outputs
            .iter()
            .filter(|o| o.output_type == output_type)
            .max_by_key(|o| o.attempt)
            .map(|o| o.value.clone()))
    }

    /// Load the full record for a content item.
    ///
    /// Returns `Ok(None)` when no record exists or the file on disk does not
    /// parse (a partial write from a crashed process is discarded, not
    /// surfaced).
    pub fn load(&self, content_id: &str) -> Result<Option<ArchiveRecord>, ArchiveError> {
        let path = match self.locate(content_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(content_id, path = %path.display(), error = %e, "discarding unreadable archive record");
                Ok(None)
            }
        }
    }

    /// True when the latest processing record is `ok` at the given versions.
    pub fn processed_ok_at(
        &self,
        content_id: &str,
        code_version: &str,
        vocab_version: &str,
    ) -> Result<bool, ArchiveError> {
        let record = match self.load(content_id)? {
            Some(r) => r,
            None => return Ok(false),
        };
        Ok(record.processing_records.iter().any(|p| {
            p.status == "ok" && p.code_version == code_version && p.vocab_version == vocab_version
        }))
    }

    /// Lazily yield the content ids matching a filter.
    ///
    /// Only the kind directories are walked; sibling state (the vocabulary
    /// store) under the archive root is not content.
    pub fn iterate(&self, filter: ArchiveFilter) -> impl Iterator<Item = String> {
        let ArchiveFilter { kind, month } = filter;
        let kinds: Vec<ContentKind> = match kind {
            Some(kind) => vec![kind],
            None => vec![ContentKind::YoutubeVideo, ContentKind::WebArticle],
        };
        let roots: Vec<PathBuf> = kinds.iter().map(|k| self.root.join(k.as_str())).collect();
        roots
            .into_iter()
            .flat_map(|base| WalkDir::new(base).min_depth(1).into_iter())
            .filter_map(|e| e.ok())
            .filter(move |e| {
                if !e.file_type().is_file() {
                    return false;
                }
                if e.path().extension().and_then(|x| x.to_str()) != Some("json") {
                    return false;
                }
                match &month {
                    Some(month) => e
                        .path()
                        .parent()
                        .and_then(|p| p.file_name())
                        .and_then(|n| n.to_str())
                        == Some(month.as_str()),
                    None => true,
                }
            })
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(decode_id)
            })
    }

    /// Aggregate token and dollar cost across all archived LLM calls.
    pub fn cost_summary(&self) -> Result<CostSummary, ArchiveError> {
        let mut summary = CostSummary::default();
        for id in self.iterate(ArchiveFilter::default()) {
            let record = match self.load(&id)? {
                Some(r) => r,
                None => continue,
            };
            summary.records += 1;
            for out in &record.llm_outputs {
                summary.llm_calls += 1;
                summary.input_tokens += out.input_tokens;
                summary.output_tokens += out.output_tokens;
                summary.cost_usd += out.cost_usd;
            }
        }
        Ok(summary)
    }

    fn path_for(&self, record: &ArchiveRecord) -> PathBuf {
        let month = format!(
            "{:04}-{:02}",
            record.provenance.fetched_at.year(),
            record.provenance.fetched_at.month()
        );
        self.root
            .join(record.kind.as_str())
            .join(month)
            .join(format!("{}.json", encode_id(&record.id)))
    }

    /// Find the record file for a content id across month directories.
    fn locate(&self, content_id: &str) -> Option<PathBuf> {
        let kind = ContentKind::of_content_id(content_id)?;
        let kind_dir = self.root.join(kind.as_str());
        let file_name = format!("{}.json", encode_id(content_id));
        let mut months: Vec<PathBuf> = std::fs::read_dir(&kind_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        // Newest month first; re-ingestions keep the original month anyway.
        months.sort();
        months.reverse();
        for month in months {
            let candidate = month.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Temp-file + rename so readers never observe a partial record.
    fn save(&self, path: &Path, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let body = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Encode a content id into a flat filename: web ids carry a `/` that must
/// not become a path separator. `%` escapes first so decoding is exact.
fn encode_id(content_id: &str) -> String {
    content_id.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`encode_id`].
fn decode_id(file_stem: &str) -> String {
    file_stem.replace("%2F", "/").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provenance() -> Provenance {
        Provenance {
            url: "https://www.youtube.com/watch?v=ABC123XYZ01".into(),
            source: "Some Channel".into(),
            fetched_at: "2026-03-14T12:00:00Z".parse().unwrap(),
        }
    }

    fn usage() -> LlmUsage {
        LlmUsage {
            model: "gpt-4o-mini".into(),
            prompt_id: "deadbeef".into(),
            input_tokens: 1200,
            output_tokens: 240,
            cost_usd: 0.00032,
            wall_ms: 842,
        }
    }

    #[test]
    fn test_write_source_and_layout() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "youtube:ABC123XYZ01",
                ContentKind::YoutubeVideo,
                "hello transcript",
                serde_json::json!({"title": "T"}),
                provenance(),
                false,
            )
            .unwrap();

        let expected = tmp
            .path()
            .join("youtube_video")
            .join("2026-03")
            .join("youtube:ABC123XYZ01.json");
        assert!(expected.is_file());
        assert_eq!(
            archive.read_source("youtube:ABC123XYZ01").unwrap(),
            "hello transcript"
        );
    }

    #[test]
    fn test_write_source_already_written() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "youtube:A",
                ContentKind::YoutubeVideo,
                "one",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap();

        let err = archive
            .write_source(
                "youtube:A",
                ContentKind::YoutubeVideo,
                "two",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyWritten { .. }));

        // Explicit overwrite is allowed and keeps the id stable.
        archive
            .write_source(
                "youtube:A",
                ContentKind::YoutubeVideo,
                "two",
                serde_json::Value::Null,
                provenance(),
                true,
            )
            .unwrap();
        assert_eq!(archive.read_source("youtube:A").unwrap(), "two");
    }

    #[test]
    fn test_llm_output_attempt_ordinals() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "youtube:A",
                ContentKind::YoutubeVideo,
                "text",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap();

        let a1 = archive
            .append_llm_output(
                "youtube:A",
                "structured_metadata",
                None,
                serde_json::json!({"title": "first"}),
                &usage(),
            )
            .unwrap();
        let a2 = archive
            .append_llm_output(
                "youtube:A",
                "structured_metadata",
                None,
                serde_json::json!({"title": "second"}),
                &usage(),
            )
            .unwrap();
        assert_eq!((a1, a2), (1, 2));

        // A different output type starts its own ordinal sequence.
        let b1 = archive
            .append_llm_output(
                "youtube:A",
                "normalized_metadata_v1",
                Some("v1"),
                serde_json::json!({"title": "norm"}),
                &usage(),
            )
            .unwrap();
        assert_eq!(b1, 1);

        let latest = archive
            .read_latest("youtube:A", "structured_metadata")
            .unwrap()
            .unwrap();
        assert_eq!(latest["title"], "second");
    }

    #[test]
    fn test_processing_records_and_idempotency_probe() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "web:example.com/post",
                ContentKind::WebArticle,
                "body",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap();

        archive
            .append_processing_record(
                "web:example.com/post",
                ProcessingRecord {
                    at: Utc::now(),
                    code_version: "0.3.0".into(),
                    vocab_version: "v1".into(),
                    embedder_model: Some("mxbai-embed-large".into()),
                    status: "ok".into(),
                    stage: "done".into(),
                    error: None,
                },
            )
            .unwrap();

        assert!(archive
            .processed_ok_at("web:example.com/post", "0.3.0", "v1")
            .unwrap());
        assert!(!archive
            .processed_ok_at("web:example.com/post", "0.3.0", "v2")
            .unwrap());
        assert!(!archive
            .processed_ok_at("web:example.com/post", "0.4.0", "v1")
            .unwrap());
    }

    #[test]
    fn test_corrupt_record_discarded() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        let dir = tmp.path().join("youtube_video").join("2026-01");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("youtube:BROKEN.json"), "{ not json").unwrap();

        assert!(archive.load("youtube:BROKEN").unwrap().is_none());
        assert!(matches!(
            archive.read_source("youtube:BROKEN"),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_id_encoding_roundtrip() {
        for id in [
            "youtube:ABC123XYZ01",
            "web:x.com/p",
            "web:x.com/50%-off",
            "web:a.com/b%2Fc",
        ] {
            assert_eq!(decode_id(&encode_id(id)), id);
        }
        assert_eq!(encode_id("web:x.com/p"), "web:x.com%2Fp");
        assert!(!encode_id("web:x.com/p").contains('/'));
    }

    #[test]
    fn test_web_record_is_a_flat_file() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "web:x.com/p",
                ContentKind::WebArticle,
                "body",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap();

        // The slash in the id must not create a nested directory.
        let expected = tmp
            .path()
            .join("web_article")
            .join("2026-03")
            .join("web:x.com%2Fp.json");
        assert!(expected.is_file());
        assert_eq!(archive.read_source("web:x.com/p").unwrap(), "body");
    }

    #[test]
    fn test_iterate_filters() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        for (id, kind) in [
            ("youtube:A", ContentKind::YoutubeVideo),
            ("youtube:B", ContentKind::YoutubeVideo),
            ("web:x.com/p", ContentKind::WebArticle),
        ] {
            archive
                .write_source(id, kind, "t", serde_json::Value::Null, provenance(), false)
                .unwrap();
        }

        let mut all: Vec<String> = archive.iterate(ArchiveFilter::default()).collect();
        all.sort();
        assert_eq!(all, vec!["web:x.com/p", "youtube:A", "youtube:B"]);

        let yt: Vec<String> = archive
            .iterate(ArchiveFilter {
                kind: Some(ContentKind::YoutubeVideo),
                month: None,
            })
            .collect();
        assert_eq!(yt.len(), 2);

        let none: Vec<String> = archive
            .iterate(ArchiveFilter {
                kind: None,
                month: Some("1999-01".into()),
            })
            .collect();
        assert!(none.is_empty());
    }

    #[test]
    fn test_cost_summary_aggregates() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::new(tmp.path());
        archive
            .write_source(
                "youtube:A",
                ContentKind::YoutubeVideo,
                "t",
                serde_json::Value::Null,
                provenance(),
                false,
            )
            .unwrap();
        archive
            .append_llm_output("youtube:A", "structured_metadata", None, serde_json::json!({}), &usage())
            .unwrap();
        archive
            .append_llm_output("youtube:A", "normalized_metadata_v1", Some("v1"), serde_json::json!({}), &usage())
            .unwrap();

        let summary = archive.cost_summary().unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.llm_calls, 2);
        assert_eq!(summary.input_tokens, 2400);
        assert!((summary.cost_usd - 0.00064).abs() < 1e-9);
    }
}
