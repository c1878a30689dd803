//! Content-addressed chunk cache.
//!
//! Chunk identity is the SHA-256 digest of the exact chunk text. Re-inserting
//! identical text is idempotent: the chunk is stored once and accumulates
//! distinct addresses, and reprocessing the same conversation twice produces
//! the same cache state. Embeddings are attached at most once per hash; a hit
//! with a pre-existing embedding skips the dispatch path entirely.
//!
//! Chunks are held in a `BTreeMap` so every traversal (pending scan, search
//! scoring) runs in hash order — deterministic across runs.

use std::collections::BTreeMap;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::dispatch;
use crate::models::{Address, Chunk, RequestRecord};
use crate::store::{read_json, write_json, BlobStore};

/// Store key for the serialized cache.
pub const CACHE_KEY: &str = "chunks";

/// SHA-256 hex digest of normalized text — the cache/dedup key.
pub fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
pub struct ChunkCache {
    chunks: BTreeMap<String, Chunk>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache from the store. Missing or corrupt state is an empty
    /// cache, rebuilt on the next save.
    pub async fn load(store: &dyn BlobStore) -> Result<Self> {
        let chunks = read_json::<BTreeMap<String, Chunk>>(store, CACHE_KEY)
            .await?
            .unwrap_or_default();
        Ok(Self { chunks })
    }

    pub async fn save(&self, store: &dyn BlobStore) -> Result<()> {
        write_json(store, CACHE_KEY, &self.chunks).await
    }

    /// Insert a chunk occurrence and return its hash.
    ///
    /// Identical text collapses into one chunk; an address already recorded
    /// for that hash is never duplicated.
    pub fn upsert(&mut self, text: &str, address: Address) -> String {
        let hash = digest(text);
        let chunk = self.chunks.entry(hash.clone()).or_insert_with(|| Chunk {
            hash: hash.clone(),
            content: text.to_string(),
            addresses: Vec::new(),
            embedding: None,
        });
        if !chunk.addresses.contains(&address) {
            chunk.addresses.push(address);
        }
        hash
    }

    /// Attach an embedding to a chunk, at most once.
    ///
    /// Returns whether the vector was stored; an unknown hash or an already
    /// embedded chunk leaves the cache unchanged.
    pub fn attach_embedding(&mut self, hash: &str, vector: Vec<f32>) -> bool {
        match self.chunks.get_mut(hash) {
            Some(chunk) if chunk.embedding.is_none() => {
                chunk.embedding = Some(vector);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, hash: &str) -> Option<&Chunk> {
        self.chunks.get(hash)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn embedded_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| c.embedding.is_some())
            .count()
    }

    /// Hashes of chunks still awaiting an embedding, in hash order.
    pub fn pending(&self) -> Vec<String> {
        self.chunks
            .values()
            .filter(|c| c.embedding.is_none())
            .map(|c| c.hash.clone())
            .collect()
    }

    /// Chunks that are searchable (embedding attached), in hash order.
    pub fn iter_embedded(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values().filter(|c| c.embedding.is_some())
    }

    /// Recover embeddings completed by a previous run but never merged.
    ///
    /// A crash between dispatch and save leaves successful responses in the
    /// durable backlog; on the next run they are attached from there instead
    /// of being re-dispatched. Returns how many were recovered.
    pub async fn reconcile_pending(&mut self, store: &dyn BlobStore) -> Result<usize> {
        let mut recovered = 0;
        for hash in self.pending() {
            let key = dispatch::backlog_key(&hash);
            let Some(records) = read_json::<Vec<RequestRecord>>(store, &key).await? else {
                continue;
            };
            let vector = records
                .iter()
                .rev()
                .find(|r| r.is_success())
                .and_then(|r| r.vector().map(<[f32]>::to_vec));
            if let Some(vector) = vector {
                if self.attach_embedding(&hash, vector) {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered embeddings from backlog");
        }
        Ok(recovered)
    }
}
