//! Dual-collection vector index.
//!
//! The [`VectorIndex`] trait is the storage capability the pipeline and the
//! ranker program against: two named collections (`content`,
//! `content_chunks`) holding 1024-dim vectors with structured payloads. Any
//! implementation satisfying the trait is substitutable — the SQLite-backed
//! [`SqliteIndex`] in production, the [`MemoryIndex`] in tests.
//!
//! Search is a brute-force cosine scan over stored vectors, which is exact
//! and entirely adequate at personal-corpus scale. Filters are applied on
//! decoded payloads so both implementations share one semantics.
//!
//! The SQLite store is single-writer: one process holds the pool open for
//! writes; retrieval opens read-only sessions.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkRecord, ContentKind, ContentRecord};

/// Payload filter applied to search candidates.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub kind: Option<String>,
    pub source: Option<String>,
    pub project: Option<String>,
    /// Restrict `content` hits to items normalized at this vocabulary version.
    pub vocab_version: Option<String>,
}

impl PayloadFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.source.is_none()
            && self.project.is_none()
            && self.vocab_version.is_none()
    }

    pub fn matches_content(&self, record: &ContentRecord) -> bool {
        if let Some(kind) = &self.kind {
            if record.kind.as_str() != kind {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &record.source != source {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if !record.projects.iter().any(|p| p == project) {
                return false;
            }
        }
        if let Some(vocab) = &self.vocab_version {
            if &record.vocab_version != vocab {
                return false;
            }
        }
        true
    }

    pub fn matches_chunk(&self, record: &ChunkRecord) -> bool {
        if let Some(kind) = &self.kind {
            // Accept either the chunk kind or the parent content kind.
            if &record.kind != kind
                && ContentKind::of_content_id(&record.doc_id).map(|k| k.as_str()) != Some(kind)
            {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &record.source != source {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if !record.projects.iter().any(|p| p == project) {
                return false;
            }
        }
        true
    }
}

/// A scored hit from the `content` collection.
#[derive(Debug, Clone)]
pub struct ContentHit {
    pub record: ContentRecord,
    pub score: f32,
}

/// A scored hit from the `content_chunks` collection.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Storage capability for the dual-representation index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a content record, idempotent by id.
    async fn upsert_content(&self, record: &ContentRecord) -> Result<()>;

    /// Replace all chunks of a document in one transaction.
    async fn upsert_chunks(&self, doc_id: &str, chunks: &[ChunkRecord]) -> Result<()>;

    /// Top-k cosine search over the `content` collection.
    async fn search_content(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ContentHit>>;

    /// Top-k cosine search over the `content_chunks` collection.
    async fn search_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ChunkHit>>;

    /// Fetch content records by id; missing ids are skipped.
    async fn fetch_content(&self, ids: &[String]) -> Result<Vec<ContentRecord>>;

    /// All content records, ordered by id. Used by offline tooling
    /// (persona bootstrap); the corpus is personal-scale.
    async fn list_content(&self) -> Result<Vec<ContentRecord>>;

    /// All chunks of a document, ordered by chunk index.
    async fn fetch_chunks(&self, doc_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Delete the content record and all chunks of a document.
    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    /// Number of content records in the index.
    async fn count_content(&self) -> Result<u64>;
}

fn top_k_content(
    mut hits: Vec<ContentHit>,
    k: usize,
) -> Vec<ContentHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(k);
    hits
}

fn top_k_chunks(mut hits: Vec<ChunkHit>, k: usize) -> Vec<ChunkHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(k);
    hits
}

// ============ SQLite implementation ============

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_content(row: &sqlx::sqlite::SqliteRow) -> Result<ContentRecord> {
    let kind_str: String = row.get("kind");
    let kind = ContentKind::parse(&kind_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown content kind in index: {}", kind_str))?;
    let tags_json: String = row.get("tags_json");
    let projects_json: String = row.get("projects_json");
    let raw_metadata_json: String = row.get("raw_metadata_json");
    let blob: Vec<u8> = row.get("embedding");

    Ok(ContentRecord {
        id: row.get("id"),
        kind,
        title: row.get("title"),
        source: row.get("source"),
        url: row.get("url"),
        summary: row.get("summary"),
        tags: serde_json::from_str(&tags_json)?,
        created_at: row.get("created_at"),
        rating: row.get("rating"),
        importance: row.get("importance"),
        projects: serde_json::from_str(&projects_json)?,
        raw_metadata: serde_json::from_str(&raw_metadata_json)?,
        vocab_version: row.get("vocab_version"),
        embedding: blob_to_vec(&blob),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    let tags_json: String = row.get("tags_json");
    let projects_json: String = row.get("projects_json");
    let blob: Vec<u8> = row.get("embedding");

    Ok(ChunkRecord {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        kind: row.get("kind"),
        title: row.get("title"),
        source: row.get("source"),
        url: row.get("url"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        local_summary: row.get("local_summary"),
        tags: serde_json::from_str(&tags_json)?,
        projects: serde_json::from_str(&projects_json)?,
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert_content(&self, record: &ContentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content (id, kind, title, source, url, summary, tags_json, created_at,
                                 rating, importance, projects_json, raw_metadata_json,
                                 vocab_version, embedding, dim)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                source = excluded.source,
                url = excluded.url,
                summary = excluded.summary,
                tags_json = excluded.tags_json,
                rating = excluded.rating,
                importance = excluded.importance,
                projects_json = excluded.projects_json,
                raw_metadata_json = excluded.raw_metadata_json,
                vocab_version = excluded.vocab_version,
                embedding = excluded.embedding,
                dim = excluded.dim
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.source)
        .bind(&record.url)
        .bind(&record.summary)
        .bind(serde_json::to_string(&record.tags)?)
        .bind(record.created_at)
        .bind(record.rating)
        .bind(&record.importance)
        .bind(serde_json::to_string(&record.projects)?)
        .bind(serde_json::to_string(&record.raw_metadata)?)
        .bind(&record.vocab_version)
        .bind(vec_to_blob(&record.embedding))
        .bind(record.embedding.len() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_chunks(&self, doc_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM content_chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO content_chunks (id, doc_id, kind, title, source, url, chunk_index,
                                            text, start_char, end_char, start_time, end_time,
                                            local_summary, tags_json, projects_json, embedding, dim)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.doc_id)
            .bind(&chunk.kind)
            .bind(&chunk.title)
            .bind(&chunk.source)
            .bind(&chunk.url)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(chunk.start_time)
            .bind(chunk.end_time)
            .bind(&chunk.local_summary)
            .bind(serde_json::to_string(&chunk.tags)?)
            .bind(serde_json::to_string(&chunk.projects)?)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(chunk.embedding.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search_content(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ContentHit>> {
        let rows = sqlx::query("SELECT * FROM content")
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let record = row_to_content(row)?;
            if !filter.matches_content(&record) {
                continue;
            }
            let score = cosine_similarity(query, &record.embedding);
            hits.push(ContentHit { record, score });
        }

        Ok(top_k_content(hits, k))
    }

    async fn search_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ChunkHit>> {
        let rows = sqlx::query("SELECT * FROM content_chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let record = row_to_chunk(row)?;
            if !filter.matches_chunk(&record) {
                continue;
            }
            let score = cosine_similarity(query, &record.embedding);
            hits.push(ChunkHit { record, score });
        }

        Ok(top_k_chunks(hits, k))
    }

    async fn fetch_content(&self, ids: &[String]) -> Result<Vec<ContentRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT * FROM content WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                records.push(row_to_content(&row)?);
            }
        }
        Ok(records)
    }

    async fn list_content(&self) -> Result<Vec<ContentRecord>> {
        let rows = sqlx::query("SELECT * FROM content ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_content).collect()
    }

    async fn fetch_chunks(&self, doc_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows =
            sqlx::query("SELECT * FROM content_chunks WHERE doc_id = ? ORDER BY chunk_index")
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM content_chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM content WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count_content(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

// ============ In-memory implementation ============

/// In-memory index with the same semantics as [`SqliteIndex`].
///
/// Used by tests and available to any embedder of the library that wants an
/// ephemeral corpus.
#[derive(Default)]
pub struct MemoryIndex {
    content: Mutex<HashMap<String, ContentRecord>>,
    chunks: Mutex<HashMap<String, Vec<ChunkRecord>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert_content(&self, record: &ContentRecord) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        content.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_chunks(&self, doc_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let mut map = self.chunks.lock().unwrap();
        map.insert(doc_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn search_content(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ContentHit>> {
        let content = self.content.lock().unwrap();
        let hits = content
            .values()
            .filter(|r| filter.matches_content(r))
            .map(|r| ContentHit {
                score: cosine_similarity(query, &r.embedding),
                record: r.clone(),
            })
            .collect();
        Ok(top_k_content(hits, k))
    }

    async fn search_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ChunkHit>> {
        let chunks = self.chunks.lock().unwrap();
        let hits = chunks
            .values()
            .flatten()
            .filter(|r| filter.matches_chunk(r))
            .map(|r| ChunkHit {
                score: cosine_similarity(query, &r.embedding),
                record: r.clone(),
            })
            .collect();
        Ok(top_k_chunks(hits, k))
    }

    async fn fetch_content(&self, ids: &[String]) -> Result<Vec<ContentRecord>> {
        let content = self.content.lock().unwrap();
        Ok(ids.iter().filter_map(|id| content.get(id).cloned()).collect())
    }

    async fn list_content(&self) -> Result<Vec<ContentRecord>> {
        let content = self.content.lock().unwrap();
        let mut out: Vec<ContentRecord> = content.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn fetch_chunks(&self, doc_id: &str) -> Result<Vec<ChunkRecord>> {
        let chunks = self.chunks.lock().unwrap();
        let mut out = chunks.get(doc_id).cloned().unwrap_or_default();
        out.sort_by_key(|c| c.chunk_index);
        Ok(out)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.content.lock().unwrap().remove(doc_id);
        self.chunks.lock().unwrap().remove(doc_id);
        Ok(())
    }

    async fn count_content(&self) -> Result<u64> {
        Ok(self.content.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk_id;

    fn content(id: &str, embedding: Vec<f32>) -> ContentRecord {
        ContentRecord {
            id: id.to_string(),
            kind: ContentKind::YoutubeVideo,
            title: format!("title {}", id),
            source: "Chan".into(),
            url: format!("https://youtube.com/watch?v={}", id),
            summary: String::new(),
            tags: vec!["rust".into()],
            created_at: 1_700_000_000,
            rating: Some(4.0),
            importance: None,
            projects: vec!["workshop".into()],
            raw_metadata: serde_json::json!({}),
            vocab_version: "v1".into(),
            embedding,
        }
    }

    fn chunk(doc_id: &str, idx: i64, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: chunk_id(doc_id, idx),
            doc_id: doc_id.to_string(),
            kind: "youtube_chunk".into(),
            title: "t".into(),
            source: "Chan".into(),
            url: "u".into(),
            chunk_index: idx,
            text: format!("chunk {}", idx),
            start_char: idx * 10,
            end_char: idx * 10 + 9,
            start_time: Some(idx as f64 * 30.0),
            end_time: Some(idx as f64 * 30.0 + 29.0),
            local_summary: None,
            tags: vec![],
            projects: vec![],
            embedding,
        }
    }

    async fn sqlite_index() -> SqliteIndex {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteIndex::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_content_idempotent() {
        let index = sqlite_index().await;
        let record = content("youtube:A", vec![1.0, 0.0, 0.0]);
        index.upsert_content(&record).await.unwrap();
        index.upsert_content(&record).await.unwrap();
        assert_eq!(index.count_content().await.unwrap(), 1);

        let fetched = index
            .fetch_content(&["youtube:A".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].tags, vec!["rust"]);
        assert_eq!(fetched[0].embedding, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_upsert_chunks_replaces() {
        let index = sqlite_index().await;
        index
            .upsert_chunks(
                "youtube:A",
                &[
                    chunk("youtube:A", 0, vec![1.0, 0.0]),
                    chunk("youtube:A", 1, vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        // Replacing with a single chunk removes the old ones.
        index
            .upsert_chunks("youtube:A", &[chunk("youtube:A", 0, vec![0.5, 0.5])])
            .await
            .unwrap();

        let chunks = index.fetch_chunks("youtube:A").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_search_chunks_ranks_by_cosine() {
        let index = sqlite_index().await;
        index
            .upsert_chunks(
                "youtube:A",
                &[
                    chunk("youtube:A", 0, vec![1.0, 0.0]),
                    chunk("youtube:A", 1, vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .search_chunks(&[1.0, 0.1], 10, &PayloadFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chunk_index, 0);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_delete_document_removes_chunks() {
        let index = sqlite_index().await;
        index
            .upsert_content(&content("youtube:A", vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .upsert_chunks("youtube:A", &[chunk("youtube:A", 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        index.delete_document("youtube:A").await.unwrap();
        assert_eq!(index.count_content().await.unwrap(), 0);
        assert!(index.fetch_chunks("youtube:A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_filters() {
        let index = sqlite_index().await;
        let mut a = content("youtube:A", vec![1.0, 0.0]);
        a.vocab_version = "v1".into();
        let mut b = content("youtube:B", vec![1.0, 0.0]);
        b.vocab_version = "v2".into();
        b.projects = vec![];
        index.upsert_content(&a).await.unwrap();
        index.upsert_content(&b).await.unwrap();

        let filter = PayloadFilter {
            vocab_version: Some("v2".into()),
            ..Default::default()
        };
        let hits = index.search_content(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "youtube:B");

        let filter = PayloadFilter {
            project: Some("workshop".into()),
            ..Default::default()
        };
        let hits = index.search_content(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "youtube:A");
    }

    #[tokio::test]
    async fn test_memory_index_mirrors_sqlite_semantics() {
        let index = MemoryIndex::new();
        index
            .upsert_content(&content("youtube:A", vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .upsert_chunks("youtube:A", &[chunk("youtube:A", 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = index
            .search_chunks(&[1.0, 0.0], 5, &PayloadFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        index.delete_document("youtube:A").await.unwrap();
        assert_eq!(index.count_content().await.unwrap(), 0);
        assert!(index.fetch_chunks("youtube:A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tie_break_is_ascending_id() {
        let index = MemoryIndex::new();
        index
            .upsert_content(&content("youtube:B", vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .upsert_content(&content("youtube:A", vec![1.0, 0.0]))
            .await
            .unwrap();

        let hits = index
            .search_content(&[1.0, 0.0], 5, &PayloadFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].record.id, "youtube:A");
        assert_eq!(hits[1].record.id, "youtube:B");
    }
}
