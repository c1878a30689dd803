//! Indexing pipeline orchestration.
//!
//! Coordinates the full flow: export parsing → chunking → cache upsert →
//! backlog reconciliation → cost preview → batch embedding dispatch →
//! merge → persistence. Per-message failures degrade locally; one bad
//! message never aborts an indexing run.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::ChunkCache;
use crate::chunk;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::export;
use crate::models::{Address, CallContext, Conversation};
use crate::store::{read_json, write_json, BlobStore};
use crate::tokenizer::Tokenizer;

/// Store key of the conversation index.
pub const INDEX_KEY: &str = "index";

pub async fn load_index(store: &dyn BlobStore) -> Result<BTreeMap<String, Conversation>> {
    Ok(read_json(store, INDEX_KEY).await?.unwrap_or_default())
}

pub async fn save_index(
    store: &dyn BlobStore,
    index: &BTreeMap<String, Conversation>,
) -> Result<()> {
    write_json(store, INDEX_KEY, index).await
}

/// Index an export file: chunk every message, embed what the cache does not
/// already cover, and persist the cache and conversation index.
pub async fn run_index(
    config: &Config,
    store: Arc<dyn BlobStore>,
    dispatcher: Arc<Dispatcher>,
    tokenizer: &Tokenizer,
    export_path: &Path,
    assume_yes: bool,
) -> Result<()> {
    let bytes = std::fs::read(export_path)
        .with_context(|| format!("Failed to read export file: {}", export_path.display()))?;
    let raw: serde_json::Value =
        serde_json::from_slice(&bytes).context("Export file is not valid JSON")?;

    let conversations = export::parse_export(&raw, config.chunking.ignore_threshold)?;

    let mut cache = ChunkCache::load(store.as_ref()).await?;
    let mut index = load_index(store.as_ref()).await?;

    for conversation in &conversations {
        for (message_index, message) in conversation.messages.iter().enumerate() {
            let pieces = chunk::split(
                tokenizer,
                &message.content,
                config.chunking.target_tokens,
                config.chunking.overlap_tokens,
            );
            for piece in pieces {
                cache.upsert(
                    &piece,
                    Address {
                        conversation_id: conversation.id.clone(),
                        message_index,
                    },
                );
            }
        }
        index.insert(conversation.id.clone(), conversation.clone());
    }

    // A previous run may have completed calls it never merged.
    let recovered = cache.reconcile_pending(store.as_ref()).await?;

    let pending = cache.pending();
    println!(
        "- {} Conversations - {} Chunks - {} Embedded -",
        index.len(),
        cache.len(),
        cache.embedded_count()
    );
    if recovered > 0 {
        println!("- Recovered {recovered} embeddings from a previous run -");
    }

    if pending.is_empty() {
        cache.save(store.as_ref()).await?;
        save_index(store.as_ref(), &index).await?;
        println!("- Up-to-Date -");
        return Ok(());
    }

    let total_tokens: usize = pending
        .iter()
        .filter_map(|hash| cache.get(hash))
        .map(|chunk| tokenizer.count_text(&chunk.content))
        .sum();
    let cost =
        total_tokens as f64 / 1000.0 * config.models.embedding.input_cost_per_1k;
    println!(
        "- {} API Calls - {} Tokens - Estimated Cost: ${:.4} -",
        pending.len(),
        total_tokens,
        cost
    );

    if !assume_yes && !confirm("- Proceed With Fetching Embeddings? (y/n): ")? {
        cache.save(store.as_ref()).await?;
        save_index(store.as_ref(), &index).await?;
        println!("- Aborted (chunks saved, embeddings deferred) -");
        return Ok(());
    }

    for hash in &pending {
        if let Some(chunk) = cache.get(hash) {
            dispatcher.enqueue(CallContext::Text(chunk.content.clone()), hash.clone());
        }
    }

    println!("- Fetching Embeddings -");
    let results = dispatcher.flush().await;

    let mut embedded = 0u64;
    let mut failed = 0u64;
    for record in &results {
        match record.vector() {
            Some(vector) if record.is_success() => {
                if cache.attach_embedding(&record.identifier, vector.to_vec()) {
                    embedded += 1;
                }
            }
            _ => {
                eprintln!(
                    "Warning: failed to embed {}: {}",
                    record.identifier,
                    record.error.as_deref().unwrap_or("no output")
                );
                failed += 1;
            }
        }
    }

    cache.save(store.as_ref()).await?;
    save_index(store.as_ref(), &index).await?;

    println!("index");
    println!("  conversations: {}", index.len());
    println!("  chunks: {}", cache.len());
    println!("  embedded: {embedded}");
    println!("  failed: {failed}");
    println!("ok");

    Ok(())
}

/// Print index and cache counters.
pub async fn run_stats(store: &dyn BlobStore) -> Result<()> {
    let cache = ChunkCache::load(store).await?;
    let index = load_index(store).await?;

    println!("stats");
    println!("  conversations: {}", index.len());
    println!("  chunks: {}", cache.len());
    println!("  embedded: {}", cache.embedded_count());
    println!("  pending: {}", cache.pending().len());

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
