//! Similarity-ranked search over the chunk cache.
//!
//! A query is embedded through the dispatcher (subject to the same rate
//! limiter as indexing), scored against every cached chunk vector with a
//! full linear scan — the archive is personal-scale, so no approximate
//! index — and aggregated back to parent conversations in first-seen order.
//!
//! Results are cached under the digest of the query string and never
//! recomputed: re-running a search must be reproducible offline, so the
//! cache is a correctness contract, not an optimization.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::debug;

use crate::cache::{digest, ChunkCache};
use crate::dispatch::Dispatcher;
use crate::models::{CallContext, SearchResult};
use crate::store::{read_json, write_json, BlobStore};

/// Store key of the cached result for one query digest.
pub fn result_key(query_digest: &str) -> String {
    format!("search/{query_digest}")
}

pub struct SearchEngine {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn BlobStore>,
}

impl SearchEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn BlobStore>) -> Self {
        Self { dispatcher, store }
    }

    /// Rank distinct parent conversations for `query`, at most `limit`.
    ///
    /// Chunks without an embedding are not yet searchable and are skipped.
    /// Equal similarity scores are ordered by chunk hash ascending, so a
    /// ranking is bit-reproducible across runs and platforms.
    pub async fn search(
        &self,
        cache: &ChunkCache,
        query: &str,
        limit: usize,
    ) -> Result<SearchResult> {
        let query_digest = digest(query);
        let key = result_key(&query_digest);

        if let Some(cached) = read_json::<SearchResult>(self.store.as_ref(), &key).await? {
            debug!(digest = %query_digest, "search served from cache");
            return Ok(cached);
        }

        let record = self
            .dispatcher
            .dispatch(
                CallContext::Text(query.to_string()),
                Some(query_digest.clone()),
            )
            .await?;

        let Some(query_vector) = record.vector() else {
            bail!(
                "Query embedding failed: {}",
                record.error.as_deref().unwrap_or("no output returned")
            );
        };

        // Linear scan in hash order; the stable sort keeps that order for
        // equal scores.
        let mut scored: Vec<(&str, f32)> = cache
            .iter_embedded()
            .map(|chunk| {
                let vector = chunk.embedding.as_deref().unwrap_or_default();
                (chunk.hash.as_str(), cosine_similarity(query_vector, vector))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut conversation_ids: Vec<String> = Vec::new();
        'outer: for (hash, _) in &scored {
            let Some(chunk) = cache.get(hash) else {
                continue;
            };
            for address in &chunk.addresses {
                if !conversation_ids.contains(&address.conversation_id) {
                    conversation_ids.push(address.conversation_id.clone());
                    if conversation_ids.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }

        let result = SearchResult {
            query: query.to_string(),
            embedding_identifier: query_digest,
            conversation_ids,
            created_at: chrono::Utc::now().timestamp(),
        };
        write_json(self.store.as_ref(), &key, &result).await?;

        Ok(result)
    }
}

/// Cosine similarity between two embedding vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
