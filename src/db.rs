//! Index database sessions.
//!
//! The vector index is single-writer, many-reader: at most one process holds
//! it open for write (the ingestion worker, reindex, persona mutation), while
//! retrieval runs against read-only sessions that WAL keeps unblocked. The
//! two entry points encode that split — [`connect`] for the writable pool,
//! [`connect_read_only`] for query-time sessions, which also refuse to create
//! a database that `curator init` has not set up yet.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Per-operation budget for a vector-store call.
const VECTOR_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only sessions are query-time only and need no pool depth.
const READER_CONNECTIONS: u32 = 2;

/// Open the writable pool. Creates the database file on first use.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    if let Some(parent) = config.index.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = base_options(config)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.index.writer_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open a read-only session for retrieval running beside an ingesting
/// worker. Fails if the database does not exist yet.
pub async fn connect_read_only(config: &Config) -> Result<SqlitePool> {
    if !config.index.path.is_file() {
        anyhow::bail!(
            "index database not found at {} (run `curator init` first)",
            config.index.path.display()
        );
    }
    let options = base_options(config)?.read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(READER_CONNECTIONS)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn base_options(config: &Config) -> Result<SqliteConnectOptions> {
    let options =
        SqliteConnectOptions::from_str(&format!("sqlite:{}", config.index.path.display()))
            .with_context(|| format!("bad index path: {}", config.index.path.display()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(VECTOR_OP_TIMEOUT);
    Ok(options)
}
