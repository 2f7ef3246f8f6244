//! # Curator
//!
//! **A personal content recommendation and knowledge engine.**
//!
//! Curator ingests long-form content — YouTube video transcripts first, web
//! articles second — through a queue-based, rate-limited, idempotent
//! pipeline: fetch, archive, chunk, embed, tag, index. Each item is tagged
//! by a two-phase LLM normalizer against an evolving controlled vocabulary
//! and stored twice in a vector index: once as a whole-document embedding,
//! once as many chunk embeddings. Retrieval composes both representations
//! with persona vectors and preference history under mode-dependent weights.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────────────────────┐   ┌───────────┐
//! │  Queue  │──▶│          Pipeline            │──▶│  SQLite   │
//! │ pending │   │ Fetch→Archive→Chunk→Embed    │   │  content  │
//! │ →done   │   │      →Tag(2-phase)→Upsert    │   │  + chunks │
//! └─────────┘   └──────────┬───────────────────┘   └─────┬─────┘
//!                          │                             │
//!                    ┌─────▼─────┐               ┌───────▼───────┐
//!                    │  Archive  │               │    Ranker     │
//!                    │ (truth)   │               │ search / rec /│
//!                    └───────────┘               │  application  │
//!                                                └───────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. Work items (URLs with optional rating/projects) wait as CSV files in
//!    a directory queue; the worker claims them by atomic rename.
//! 2. The [`fetch_youtube`] / [`fetch_web`] fetchers retrieve raw content,
//!    optionally through a rotating proxy, under a rolling rate window.
//! 3. The [`archive`] stores the verbatim text, every LLM output with its
//!    cost, and one processing record per attempt — append-only, atomic,
//!    and sufficient to rebuild everything else.
//! 4. The [`chunk`] module splits transcripts on time+token boundaries and
//!    web pages on structure; [`embedding`] produces 1024-dim vectors for
//!    chunks and whole documents.
//! 5. The [`normalize`] passes extract raw metadata and consolidate its
//!    tags against the active [`vocab`] version, grounded by semantic
//!    neighbors.
//! 6. [`search`] ranks documents by weighted chunk, global, persona, and
//!    preference signals per query mode.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: content items, chunks, metadata blocks |
//! | [`error`] | Failure taxonomy with terminal/retryable dispositions |
//! | [`archive`] | Append-only JSON archive (source of truth) |
//! | [`queue`] | Directory queue and rolling rate-limit windows |
//! | [`fetch_youtube`] | Transcript fetcher with caption-track selection |
//! | [`fetch_web`] | Web page fetcher and structure-aware HTML parse |
//! | [`chunk`] | Transcript and web chunkers |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`llm`] | Chat-completion client with usage/cost accounting |
//! | [`normalize`] | Two-phase tag normalization |
//! | [`vocab`] | Versioned controlled vocabulary |
//! | [`vector_store`] | Dual-collection vector index (trait + SQLite + memory) |
//! | [`ingest`] | Queue worker: state machine, idempotency, retry routing |
//! | [`search`] | Mode-weighted retrieval ranker |
//! | [`pref`] | Preference score over user feedback |
//! | [`persona`] | Persona vectors and k-means bootstrap |
//! | [`reindex`] | Archive → index rebuild |
//! | [`status`] | Operator status and cost reporting |
//! | [`db`] / [`migrate`] | SQLite connection and schema |

pub mod archive;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch_web;
pub mod fetch_youtube;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod persona;
pub mod pref;
pub mod queue;
pub mod reindex;
pub mod search;
pub mod status;
pub mod vector_store;
pub mod vocab;
