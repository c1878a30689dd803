//! Model endpoint capability.
//!
//! A [`ModelEndpoint`] turns a [`CallContext`] into an HTTP-style
//! `{status, body}` pair and knows how to parse its own success shape. The
//! dispatcher stays vendor-agnostic: it only looks at the status code
//! convention (2xx success, 5xx transient, other non-2xx terminal).
//!
//! One implementation per model kind: [`ChatEndpoint`] posts a message list
//! to a completions API, [`EmbeddingEndpoint`] posts text to an embeddings
//! API. Both share a single `reqwest::Client`, so batch flushes reuse one
//! connection pool.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::{CallContext, ModelKind, ModelSpec, Output, Usage};
use crate::tokenizer;

/// Raw HTTP-shaped outcome of one endpoint call.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Value,
    /// Response text for non-2xx statuses, for the audit trail.
    pub error: Option<String>,
}

#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    fn kind(&self) -> ModelKind;

    /// Post the context to the remote model.
    ///
    /// Transport failures (connect, timeout) are `Err`; any HTTP response,
    /// including failures, is `Ok` with its status code.
    async fn call(&self, context: &CallContext) -> Result<RawResponse>;

    /// Parse a 2xx body into output plus structured usage.
    fn parse_success(&self, body: &Value) -> Result<(Output, Usage)>;
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

fn api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    key: &str,
    params: &Value,
) -> Result<RawResponse> {
    let response = client
        .post(url)
        .bearer_auth(key)
        .json(params)
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let error = if (200..300).contains(&status) {
        None
    } else {
        Some(text)
    };

    Ok(RawResponse {
        status,
        body,
        error,
    })
}

// ============ Chat completions ============

pub struct ChatEndpoint {
    spec: ModelSpec,
    client: reqwest::Client,
    api_key: String,
}

impl ChatEndpoint {
    pub fn new(spec: ModelSpec, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            spec,
            client: build_client(timeout_secs)?,
            api_key: api_key()?,
        })
    }
}

#[async_trait]
impl ModelEndpoint for ChatEndpoint {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Chat
    }

    async fn call(&self, context: &CallContext) -> Result<RawResponse> {
        // Bare text is promoted to a single user turn.
        let messages = match context {
            CallContext::Messages(messages) => json!(messages),
            CallContext::Text(text) => json!([{ "role": "user", "content": text }]),
        };

        let params = json!({
            "model": self.spec.name,
            "messages": messages,
            "temperature": 0.0,
        });

        post_json(&self.client, &self.spec.endpoint, &self.api_key, &params).await
    }

    fn parse_success(&self, body: &Value) -> Result<(Output, Usage)> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .context("Completion response missing choices[0].message.content")?;
        let usage = tokenizer::completion_usage(
            body.get("usage").unwrap_or(&Value::Null),
            &self.spec,
        );
        Ok((Output::Text(content.to_string()), usage))
    }
}

// ============ Embeddings ============

pub struct EmbeddingEndpoint {
    spec: ModelSpec,
    client: reqwest::Client,
    api_key: String,
}

impl EmbeddingEndpoint {
    pub fn new(spec: ModelSpec, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            spec,
            client: build_client(timeout_secs)?,
            api_key: api_key()?,
        })
    }
}

#[async_trait]
impl ModelEndpoint for EmbeddingEndpoint {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Embedding
    }

    async fn call(&self, context: &CallContext) -> Result<RawResponse> {
        let CallContext::Text(text) = context else {
            bail!("Embedding endpoint takes text input, not a message list");
        };

        let params = json!({
            "model": self.spec.name,
            "input": [text],
            "encoding_format": "float",
        });

        post_json(&self.client, &self.spec.endpoint, &self.api_key, &params).await
    }

    fn parse_success(&self, body: &Value) -> Result<(Output, Usage)> {
        let values = body
            .pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .context("Embedding response missing data[0].embedding")?;

        let vector: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if let Some(dims) = self.spec.dims {
            if vector.len() != dims {
                bail!(
                    "Embedding dimensionality mismatch: got {}, expected {dims}",
                    vector.len()
                );
            }
        }

        let usage = tokenizer::embedding_usage(
            body.get("usage").unwrap_or(&Value::Null),
            &self.spec,
        );
        Ok((Output::Vector(vector), usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dims: Option<usize>) -> ModelSpec {
        ModelSpec {
            name: "test-model".to_string(),
            endpoint: "https://example.test".to_string(),
            context_window: 8192,
            tokens_per_minute: 1000,
            requests_per_minute: 100,
            input_cost_per_1k: 0.001,
            output_cost_per_1k: 0.002,
            dims,
        }
    }

    fn chat_endpoint() -> ChatEndpoint {
        ChatEndpoint {
            spec: spec(None),
            client: reqwest::Client::new(),
            api_key: "test".to_string(),
        }
    }

    fn embedding_endpoint(dims: Option<usize>) -> EmbeddingEndpoint {
        EmbeddingEndpoint {
            spec: spec(dims),
            client: reqwest::Client::new(),
            api_key: "test".to_string(),
        }
    }

    #[test]
    fn test_parse_completion_success() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        });

        let (output, usage) = chat_endpoint().parse_success(&body).unwrap();
        assert!(matches!(output, Output::Text(t) if t == "hi there"));
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn test_parse_completion_missing_content_fails() {
        let body = json!({"choices": []});
        assert!(chat_endpoint().parse_success(&body).is_err());
    }

    #[test]
    fn test_parse_embedding_success() {
        let body = json!({
            "data": [{"embedding": [0.25, -0.5, 1.0]}],
            "usage": {"prompt_tokens": 7},
        });

        let (output, usage) = embedding_endpoint(Some(3)).parse_success(&body).unwrap();
        assert!(matches!(output, Output::Vector(v) if v == vec![0.25, -0.5, 1.0]));
        assert_eq!(usage.input_tokens, 7);
    }

    #[test]
    fn test_parse_embedding_dims_mismatch_fails() {
        let body = json!({"data": [{"embedding": [0.1, 0.2]}], "usage": {}});
        assert!(embedding_endpoint(Some(3)).parse_success(&body).is_err());
    }
}
