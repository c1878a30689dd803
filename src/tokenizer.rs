//! Token accounting on the cl100k_base BPE.
//!
//! Wraps [`tiktoken_rs`] for exact tokenize/stringify round-trips (the
//! chunker slices token streams directly) and implements the chat-style cost
//! model: a fixed 4-unit overhead per message, the summed length of every
//! field value, and a 3-unit terminator.

use anyhow::{Context, Result};
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::models::{CallContext, ChatMessage, ModelSpec, Usage};

/// Fixed token overhead billed per message in a chat-style request.
const TOKENS_PER_MESSAGE: usize = 4;
/// Fixed token overhead billed once per chat-style request.
const TOKENS_PER_REQUEST: usize = 3;

pub struct Tokenizer {
    bpe: CoreBPE,
}

impl Tokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().context("Failed to load cl100k_base encoding")?;
        Ok(Self { bpe })
    }

    /// Encode text into its token stream.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    /// Decode a token slice back into text.
    ///
    /// Fails when the slice ends inside a multi-byte sequence; callers fall
    /// back to the untouched source text in that case.
    pub fn stringify(&self, tokens: Vec<u32>) -> Result<String> {
        self.bpe
            .decode(tokens)
            .map_err(|e| anyhow::anyhow!("Failed to decode token stream: {e}"))
    }

    /// Token count of plain text.
    pub fn count_text(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }

    /// Token count of a structured message list, including the per-message
    /// and per-request structural overhead billed by chat-style APIs.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        let mut total = 0;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += self.count_text(&message.role);
            total += self.count_text(&message.content);
        }
        total + TOKENS_PER_REQUEST
    }

    pub fn count_context(&self, context: &CallContext) -> usize {
        match context {
            CallContext::Text(text) => self.count_text(text),
            CallContext::Messages(messages) => self.count_messages(messages),
        }
    }
}

/// Parse a completions usage block into structured token/cost accounting.
pub fn completion_usage(usage: &Value, spec: &ModelSpec) -> Usage {
    let input_tokens = read_u32(usage, "prompt_tokens");
    let output_tokens = read_u32(usage, "completion_tokens");
    let total_tokens = match usage.get("total_tokens") {
        Some(_) => read_u32(usage, "total_tokens"),
        None => input_tokens + output_tokens,
    };

    let input_cost = f64::from(input_tokens) / 1000.0 * spec.input_cost_per_1k;
    let output_cost = f64::from(output_tokens) / 1000.0 * spec.output_cost_per_1k;

    Usage {
        input_tokens,
        output_tokens,
        total_tokens,
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
    }
}

/// Parse an embeddings usage block; embeddings bill input tokens only.
pub fn embedding_usage(usage: &Value, spec: &ModelSpec) -> Usage {
    let input_tokens = read_u32(usage, "prompt_tokens");
    let input_cost = f64::from(input_tokens) / 1000.0 * spec.input_cost_per_1k;

    Usage {
        input_tokens,
        output_tokens: 0,
        total_tokens: input_tokens,
        input_cost,
        output_cost: 0.0,
        total_cost: input_cost,
    }
}

fn read_u32(usage: &Value, field: &str) -> u32 {
    match usage.get(field).and_then(Value::as_u64) {
        Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
        None => {
            warn!(field, "usage block missing token field");
            0
        }
    }
}
