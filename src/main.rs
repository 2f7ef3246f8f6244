//! Curator CLI — a personal content recommendation and knowledge engine.
//!
//! ```bash
//! curator init                                   # create the index schema
//! curator enqueue https://www.youtube.com/watch?v=...
//! curator ingest --once                          # drain the queue
//! curator vocab seed                             # seed v1 from the corpus
//! curator search "retrieval augmented generation" --mode search
//! curator status --costs
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use curator::{config, db, ingest, migrate, persona, queue, reindex, search, status, vocab};
use curator::queue::{ItemClass, WorkItem};
use curator::vector_store::{SqliteIndex, VectorIndex};

#[derive(Parser)]
#[command(
    name = "curator",
    about = "Curator — a personal content recommendation and knowledge engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/curator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database schema
    Init,

    /// Add a URL to the ingestion queue
    Enqueue {
        /// YouTube watch URL or article URL
        url: String,

        /// Display title override
        #[arg(long)]
        title: Option<String>,

        /// User rating (0–5)
        #[arg(long)]
        rating: Option<f64>,

        /// Importance label
        #[arg(long)]
        importance: Option<String>,

        /// Project identifiers (semicolon-separated)
        #[arg(long)]
        projects: Option<String>,

        /// Count against the scheduled (not manual) rate budget
        #[arg(long)]
        scheduled: bool,
    },

    /// Run the ingestion worker over the queue
    Ingest {
        /// Exit when the queue is drained instead of watching it
        #[arg(long)]
        once: bool,

        /// Stop after this many items
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Query the index
    Search {
        /// Query text
        query: String,

        /// Query mode: search, recommendation, or application
        #[arg(long, default_value = "search")]
        mode: String,

        /// Filter by content kind (youtube_video | web_article)
        #[arg(long)]
        kind: Option<String>,

        /// Filter by source (channel name or domain)
        #[arg(long)]
        source: Option<String>,

        /// Filter by project identifier
        #[arg(long)]
        project: Option<String>,

        /// Persona blend, repeatable: --persona label=weight
        #[arg(long = "persona")]
        personas: Vec<String>,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-run Phase-2 normalization against the active vocabulary
    Renormalize {
        /// A single content id (default: the whole archive)
        #[arg(long)]
        id: Option<String>,

        /// Re-normalize even items already at the active version
        #[arg(long)]
        force: bool,
    },

    /// Rebuild both index collections from the archive
    Reindex,

    /// Remove a content item and all its chunks from the index
    ///
    /// The archive record is never deleted; `reindex` restores the item.
    Delete {
        /// Content id (e.g. youtube:ABC123XYZ01)
        id: String,
    },

    /// Manage the controlled vocabulary
    Vocab {
        #[command(subcommand)]
        action: VocabAction,
    },

    /// Manage personas
    Persona {
        #[command(subcommand)]
        action: PersonaAction,
    },

    /// Show queue, vocabulary, and index status
    Status {
        /// Also aggregate LLM costs from the archive
        #[arg(long)]
        costs: bool,
    },
}

#[derive(Subcommand)]
enum VocabAction {
    /// Seed v1 from raw tags across the archive and activate it
    Seed {
        /// Number of canonical forms to materialize
        #[arg(long, default_value_t = 50)]
        top_k: usize,
    },

    /// Print the active vocabulary
    Show,

    /// Apply a proposals JSON file, producing the next version
    Consolidate {
        /// Path to proposals JSON ({merges, renames, additions})
        proposals: PathBuf,

        /// Point the active version at the result
        #[arg(long)]
        activate: bool,
    },

    /// Point the active version at an existing snapshot
    Activate {
        version: String,
    },
}

#[derive(Subcommand)]
enum PersonaAction {
    /// List stored personas
    List,

    /// Softly assign a content item to a persona
    Assign {
        content_id: String,
        label: String,

        /// Assignment weight in (0, 1]
        #[arg(long, default_value_t = 1.0)]
        weight: f64,
    },

    /// Rebuild a persona vector from its assignments
    Build {
        label: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Cluster the corpus for cold-start persona discovery
    Bootstrap {
        #[arg(long, default_value_t = 2)]
        k_min: usize,

        #[arg(long, default_value_t = 8)]
        k_max: usize,

        /// Materialize a cluster as a persona, repeatable: --label 0=woodworking
        #[arg(long = "label")]
        labels: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            queue::Queue::new(&cfg.queue.root).ensure_dirs()?;
            std::fs::create_dir_all(&cfg.archive.root)?;
            println!("Index, queue, and archive initialized.");
        }
        Commands::Enqueue {
            url,
            title,
            rating,
            importance,
            projects,
            scheduled,
        } => {
            // Fail fast on URLs the pipeline cannot derive an id from.
            ingest::derive_content_id(&url)?;
            let item = WorkItem {
                url,
                title,
                rating,
                importance,
                projects: projects
                    .map(|p| {
                        p.split(';')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                class: if scheduled {
                    ItemClass::Scheduled
                } else {
                    ItemClass::Manual
                },
                attempts: 0,
            };
            let path = queue::Queue::new(&cfg.queue.root).enqueue(&item)?;
            println!("enqueued: {}", path.display());
        }
        Commands::Ingest { once, limit } => {
            ingest::run_worker(&cfg, once, limit).await?;
        }
        Commands::Search {
            query,
            mode,
            kind,
            source,
            project,
            personas,
            limit,
        } => {
            let mode = search::QueryMode::parse(&mode)?;
            let filters = search::QueryFilters {
                kind,
                source,
                project,
            };

            // Retrieval is read-only and may run beside an ingesting worker.
            let pool = db::connect_read_only(&cfg).await?;
            let blend = resolve_persona_blend(&pool, &personas).await?;
            let index = SqliteIndex::new(pool);

            let results =
                search::query(&cfg, &index, &blend, &query, mode, &filters, limit).await?;
            print_results(&results);
            index.pool().close().await;
        }
        Commands::Renormalize { id, force } => {
            ingest::run_renormalize(&cfg, id.as_deref(), force).await?;
        }
        Commands::Reindex => {
            reindex::run_reindex(&cfg).await?;
        }
        Commands::Delete { id } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let index = SqliteIndex::new(pool);
            index.delete_document(&id).await?;
            println!("deleted {} from both collections", id);
            index.pool().close().await;
        }
        Commands::Vocab { action } => run_vocab(&cfg, action)?,
        Commands::Persona { action } => run_persona(&cfg, action).await?,
        Commands::Status { costs } => {
            status::run_status(&cfg, costs).await?;
        }
    }

    Ok(())
}

fn run_vocab(cfg: &config::Config, action: VocabAction) -> Result<()> {
    let store = vocab::VocabStore::new(&cfg.archive.root);
    match action {
        VocabAction::Seed { top_k } => {
            let archive = curator::archive::Archive::new(&cfg.archive.root);
            let vocabulary = store.seed_from_corpus(&archive, top_k)?;
            store.set_active(&vocabulary.version)?;
            println!(
                "seeded {} with {} canonical forms (now active)",
                vocabulary.version,
                vocabulary.entries.len()
            );
        }
        VocabAction::Show => match store.load_active()? {
            Some(vocabulary) => {
                println!("vocabulary {} ({} forms)", vocabulary.version, vocabulary.entries.len());
                for entry in &vocabulary.entries {
                    let aliases = if entry.aliases.is_empty() {
                        String::new()
                    } else {
                        format!("  (aliases: {})", entry.aliases.join(", "))
                    };
                    println!("  {} ×{}{}", entry.canonical, entry.frequency, aliases);
                }
                let tentative = store.load_tentative()?;
                if !tentative.is_empty() {
                    println!("tentative:");
                    for (tag, info) in tentative {
                        println!("  {} ×{}", tag, info.count);
                    }
                }
            }
            None => println!("no active vocabulary; run `curator vocab seed`"),
        },
        VocabAction::Consolidate {
            proposals,
            activate,
        } => {
            let current = store
                .load_active()?
                .context("no active vocabulary to consolidate from")?;
            let content = std::fs::read_to_string(&proposals)
                .with_context(|| format!("cannot read proposals: {}", proposals.display()))?;
            let proposals: vocab::Proposals = serde_json::from_str(&content)?;
            let next = store.consolidate(&current, &proposals)?;
            if activate {
                store.set_active(&next.version)?;
            }
            println!(
                "consolidated {} → {}{}",
                current.version,
                next.version,
                if activate { " (now active)" } else { "" }
            );
        }
        VocabAction::Activate { version } => {
            store.load(&version)?;
            store.set_active(&version)?;
            println!("active vocabulary: {}", version);
        }
    }
    Ok(())
}

async fn run_persona(cfg: &config::Config, action: PersonaAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;

    match action {
        PersonaAction::List => {
            let personas = persona::load_personas(&pool).await?;
            if personas.is_empty() {
                println!("no personas stored");
            }
            for p in personas {
                println!(
                    "{} (dim {}, weight {:.1}) — {}",
                    p.label,
                    p.vector.len(),
                    p.weight_sum,
                    p.description
                );
            }
        }
        PersonaAction::Assign {
            content_id,
            label,
            weight,
        } => {
            persona::assign(&pool, &content_id, &label, weight).await?;
            println!("assigned {} to {} (weight {})", content_id, label, weight);
        }
        PersonaAction::Build { label, description } => {
            let index = SqliteIndex::new(pool.clone());
            let description = if description.is_empty() {
                cfg.personas
                    .iter()
                    .find(|p| p.label == label)
                    .map(|p| p.description.clone())
                    .unwrap_or_default()
            } else {
                description
            };
            let built = persona::build_persona(&pool, &index, &label, &description).await?;
            println!(
                "built persona {} from weight {:.1}",
                built.label, built.weight_sum
            );
        }
        PersonaAction::Bootstrap {
            k_min,
            k_max,
            labels,
        } => {
            let mut label_map = HashMap::new();
            for spec in labels {
                let (cluster, label) = spec
                    .split_once('=')
                    .with_context(|| format!("expected CLUSTER=LABEL, got {}", spec))?;
                label_map.insert(
                    cluster.parse::<usize>().context("cluster must be a number")?,
                    label.to_string(),
                );
            }
            let index = SqliteIndex::new(pool.clone());
            persona::run_bootstrap(&pool, &index, k_min, k_max, &label_map).await?;
        }
    }

    pool.close().await;
    Ok(())
}

/// Parse `label=weight` blend flags and resolve them against stored
/// personas. A bare `label` gets weight 1; weights must sum to ≤ 1 after
/// normalization, so they are normalized here.
async fn resolve_persona_blend(
    pool: &sqlx::SqlitePool,
    specs: &[String],
) -> Result<Vec<(persona::Persona, f64)>> {
    if specs.is_empty() {
        return Ok(Vec::new());
    }

    let mut blend = Vec::new();
    for spec in specs {
        let (label, weight) = match spec.split_once('=') {
            Some((label, weight)) => (
                label.to_string(),
                weight
                    .parse::<f64>()
                    .with_context(|| format!("bad persona weight in {}", spec))?,
            ),
            None => (spec.clone(), 1.0),
        };
        let Some(p) = persona::load_persona(pool, &label).await? else {
            bail!("unknown persona: {} (run `curator persona build {}`)", label, label);
        };
        blend.push((p, weight));
    }

    let total: f64 = blend.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        bail!("persona blend weights must sum to a positive value");
    }
    for (_, w) in &mut blend {
        *w /= total;
    }
    Ok(blend)
}

fn print_results(results: &[search::RankedDoc]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            result.score,
            result.source,
            result.title
        );
        println!(
            "    signals: chunk {:.3} | global {:.3} | persona {:.3} | pref {:.3}",
            result.chunk_score, result.global_score, result.persona_score, result.pref_score
        );
        println!("    url: {}", result.url);
        if !result.summary.is_empty() {
            println!("    summary: {}", result.summary);
        }
        for chunk in &result.top_chunks {
            let location = match (chunk.start_time, chunk.end_time) {
                (Some(start), Some(end)) => format!(" [{}s–{}s]", start as i64, end as i64),
                _ => String::new(),
            };
            println!(
                "    chunk {}{}: \"{}\"",
                chunk.chunk_index,
                location,
                chunk.excerpt.replace('\n', " ")
            );
        }
        println!("    id: {}", result.doc_id);
        println!();
    }
}
