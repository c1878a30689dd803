use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{ModelKind, ModelSpec};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub dispatch: DispatchConfig,
    pub models: ModelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            chunking: ChunkingConfig::default(),
            search: SearchConfig::default(),
            dispatch: DispatchConfig::default(),
            models: ModelsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/recall.db"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Approximate length (tokens) of each chunk a message is broken into.
    pub target_tokens: usize,
    /// Approximate length (tokens) of the overlap between adjacent chunks.
    pub overlap_tokens: usize,
    /// Minimum content length (characters) to index at all.
    pub ignore_threshold: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 1024,
            overlap_tokens: 128,
            ignore_threshold: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of distinct conversations a search returns.
    pub result_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { result_limit: 10 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retry budget for retryable upstream failures (503s are free).
    pub max_attempts: u32,
    /// Initial backoff; doubles on every retry.
    pub backoff_ms: u64,
    /// Per-request transport timeout.
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelsConfig {
    pub chat: ModelConfig,
    pub embedding: ModelConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat: ModelConfig {
                name: "gpt-4o".to_string(),
                endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                context_window: 128_000,
                tokens_per_minute: 600_000,
                requests_per_minute: 5_000,
                input_cost_per_1k: 0.005,
                output_cost_per_1k: 0.015,
                dims: None,
            },
            embedding: ModelConfig {
                name: "text-embedding-3-large".to_string(),
                endpoint: "https://api.openai.com/v1/embeddings".to_string(),
                context_window: 8_191,
                tokens_per_minute: 5_000_000,
                requests_per_minute: 5_000,
                input_cost_per_1k: 0.00013,
                output_cost_per_1k: 0.0,
                dims: Some(3_072),
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub endpoint: String,
    pub context_window: usize,
    pub tokens_per_minute: u32,
    pub requests_per_minute: u32,
    /// Cost per 1000 input tokens, in dollars.
    pub input_cost_per_1k: f64,
    #[serde(default)]
    pub output_cost_per_1k: f64,
    #[serde(default)]
    pub dims: Option<usize>,
}

impl ModelConfig {
    pub fn to_spec(&self) -> ModelSpec {
        ModelSpec {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            context_window: self.context_window,
            tokens_per_minute: self.tokens_per_minute,
            requests_per_minute: self.requests_per_minute,
            input_cost_per_1k: self.input_cost_per_1k,
            output_cost_per_1k: self.output_cost_per_1k,
            dims: self.dims,
        }
    }
}

impl Config {
    pub fn model(&self, kind: ModelKind) -> &ModelConfig {
        match kind {
            ModelKind::Chat => &self.models.chat,
            ModelKind::Embedding => &self.models.embedding,
        }
    }
}

/// Load configuration from a TOML file.
///
/// A missing file yields the built-in defaults so `rcl` works out of the
/// box; an unreadable or invalid file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }

    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.target_tokens");
    }

    if config.search.result_limit < 1 {
        anyhow::bail!("search.result_limit must be >= 1");
    }

    if config.dispatch.backoff_ms == 0 {
        anyhow::bail!("dispatch.backoff_ms must be > 0");
    }

    for (label, model) in [
        ("models.chat", &config.models.chat),
        ("models.embedding", &config.models.embedding),
    ] {
        if model.tokens_per_minute == 0 || model.requests_per_minute == 0 {
            anyhow::bail!("{}: rate limits must be > 0", label);
        }
        if model.context_window == 0 {
            anyhow::bail!("{}: context_window must be > 0", label);
        }
    }

    Ok(config)
}
