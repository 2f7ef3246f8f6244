//! Operator status view.
//!
//! Reports queue depths, the rolling rate-window budgets, the active
//! vocabulary version, index counts, and (on request) the aggregate LLM
//! spend computed from the archive.

use anyhow::Result;

use crate::archive::Archive;
use crate::config::Config;
use crate::db;
use crate::queue::Queue;
use crate::vector_store::{SqliteIndex, VectorIndex};
use crate::vocab::VocabStore;

pub async fn run_status(config: &Config, costs: bool) -> Result<()> {
    let queue = Queue::new(&config.queue.root);
    queue.ensure_dirs()?;
    let counts = queue.counts()?;

    println!("queue");
    println!("  pending: {}", counts.pending);
    println!("  processing: {}", counts.processing);
    println!("  completed: {}", counts.completed);

    let window = &config.rate_limit.youtube;
    println!("rate window (youtube)");
    if config.proxy.url.is_some() {
        println!("  proxy configured: window bypassed");
    } else {
        // The window itself is process-local; from here we can only show
        // the configured budget.
        println!(
            "  budget: {} manual + {} scheduled per {}s",
            window.max_manual, window.max_scheduled, window.window_seconds
        );
    }

    let vocab_store = VocabStore::new(&config.archive.root);
    println!("vocabulary");
    match vocab_store.active_version()? {
        Some(version) => {
            let vocab = vocab_store.load(&version)?;
            println!("  active: {} ({} canonical forms)", version, vocab.entries.len());
        }
        None => println!("  active: none (run `curator vocab seed`)"),
    }
    let tentative = vocab_store.load_tentative()?;
    if !tentative.is_empty() {
        println!("  tentative forms awaiting consolidation: {}", tentative.len());
    }

    if config.index.path.is_file() {
        let pool = db::connect_read_only(config).await?;
        let index = SqliteIndex::new(pool);
        println!("index");
        println!("  content records: {}", index.count_content().await?);
        index.pool().close().await;
    } else {
        println!("index");
        println!("  not initialized (run `curator init`)");
    }

    if costs {
        let archive = Archive::new(&config.archive.root);
        let summary = archive.cost_summary()?;
        println!("archive costs");
        println!("  records: {}", summary.records);
        println!("  llm calls: {}", summary.llm_calls);
        println!(
            "  tokens: {} in / {} out",
            summary.input_tokens, summary.output_tokens
        );
        println!("  total cost: ${:.4}", summary.cost_usd);
    }

    Ok(())
}
