//! Core data models used throughout chat-recall.
//!
//! These types represent the conversations, chunks, requests, and search
//! results that flow through the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Which remote model a dispatcher talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Embedding,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Chat => write!(f, "chat"),
            ModelKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// Immutable descriptor for one remote model.
///
/// Costs are per 1000 tokens; rate limits are per minute.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub endpoint: String,
    pub context_window: usize,
    pub tokens_per_minute: u32,
    pub requests_per_minute: u32,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    /// Embedding output dimensionality; `None` for chat models.
    pub dims: Option<usize>,
}

/// One turn of a conversation, in the wire shape chat APIs expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A normalized conversation from the export, stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub url: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// A `(conversation, message)` pointer from a chunk back to where it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub conversation_id: String,
    pub message_index: usize,
}

/// A bounded, possibly overlapping slice of a message's text — the unit of
/// embedding and search.
///
/// Identity is the SHA-256 digest of the exact chunk content. Identical text
/// anywhere in the archive collapses into one chunk that accumulates
/// addresses. The embedding is attached at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub hash: String,
    pub content: String,
    pub addresses: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// The input handed to a model endpoint: plain text for embeddings, a
/// message list for chat completions.
#[derive(Debug, Clone)]
pub enum CallContext {
    Text(String),
    Messages(Vec<ChatMessage>),
}

/// Parsed output of a successful model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Output {
    Text(String),
    Vector(Vec<f32>),
}

/// Structured token and cost accounting parsed from a response usage block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Where a dispatched call ended up.
///
/// `Retrying` only ever appears on intermediate backlog records; the record
/// returned to the caller is `Success`, `Exhausted`, or `Terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Retrying,
    Exhausted,
    Terminal,
}

/// The durable result of one dispatched call (or one attempt of it, in the
/// backlog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub identifier: String,
    pub model: String,
    pub status: RequestStatus,
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retries: u32,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
}

impl RequestRecord {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }

    /// The embedding vector, if this record carries one.
    pub fn vector(&self) -> Option<&[f32]> {
        match &self.output {
            Some(Output::Vector(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// The completion text, if this record carries one.
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            Some(Output::Text(t)) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// A cached, ranked answer to one search query.
///
/// Keyed by the digest of the query string; immutable once written, so
/// re-running the same query is reproducible offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    /// Identifier of the embedding request that produced the query vector
    /// (equal to the query digest).
    pub embedding_identifier: String,
    pub conversation_ids: Vec<String>,
    pub created_at: i64,
}
