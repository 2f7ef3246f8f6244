//! Index database schema migrations.
//!
//! Creates the two vector collections (`content`, `content_chunks`) plus the
//! persona tables, and ensures idempotent execution. Designed to be run via
//! `curator init`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an already-open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per content item; vector is the 1024-dim global embedding.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            url TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            rating REAL,
            importance TEXT,
            projects_json TEXT NOT NULL DEFAULT '[]',
            raw_metadata_json TEXT NOT NULL DEFAULT '{}',
            vocab_version TEXT NOT NULL DEFAULT '',
            embedding BLOB NOT NULL,
            dim INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per chunk; vector is the 1024-dim chunk embedding. Chunk text
    // is materialized here because retrieval surfaces it directly.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_chunks (
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            url TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            start_time REAL,
            end_time REAL,
            local_summary TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            projects_json TEXT NOT NULL DEFAULT '[]',
            embedding BLOB NOT NULL,
            dim INTEGER NOT NULL,
            UNIQUE(doc_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS personas (
            label TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            vector BLOB NOT NULL,
            dim INTEGER NOT NULL,
            weight_sum REAL NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Soft many-to-many assignment; weights per content id sum to <= 1.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS persona_assignments (
            content_id TEXT NOT NULL,
            label TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            PRIMARY KEY (content_id, label)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON content_chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_kind ON content(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_vocab ON content(vocab_version)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assignments_label ON persona_assignments(label)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
