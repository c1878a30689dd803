//! # chat-recall CLI (`rcl`)
//!
//! The `rcl` binary indexes an exported chat-assistant archive, searches it
//! semantically, and resumes conversations.
//!
//! ## Usage
//!
//! ```bash
//! rcl --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rcl init` | Create the SQLite store |
//! | `rcl index <export.json>` | Chunk, embed, and index an export |
//! | `rcl search "<query>"` | Rank conversations by semantic similarity |
//! | `rcl chat <conversation-id>` | Resume an indexed conversation |
//! | `rcl stats` | Show index and cache counters |
//!
//! The `OPENAI_API_KEY` environment variable must be set for commands that
//! call the model endpoints (`index`, `search`, `chat`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use chat_recall::config::{self, Config};
use chat_recall::dispatch::{Dispatcher, RetryPolicy};
use chat_recall::endpoint::{ChatEndpoint, EmbeddingEndpoint, ModelEndpoint};
use chat_recall::limiter::RateLimiter;
use chat_recall::models::ModelKind;
use chat_recall::search::SearchEngine;
use chat_recall::store::{BlobStore, SqliteStore};
use chat_recall::tokenizer::Tokenizer;
use chat_recall::{cache, chat, ingest};

/// chat-recall — semantic search and resume for exported chat archives.
#[derive(Parser)]
#[command(
    name = "rcl",
    about = "chat-recall — semantic search and resume for exported chat-assistant archives",
    version,
    long_about = "chat-recall normalizes a conversation export, chunks and embeds its messages \
    through a rate-limited dispatch pipeline, and answers queries by cosine similarity over the \
    cached vectors. Any result can be resumed as a live conversation."
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when the
    /// file does not exist.
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the store.
    ///
    /// Creates the SQLite database file and its schema. Idempotent.
    Init,

    /// Index a conversation export.
    ///
    /// Parses the export, chunks every message, reconciles embeddings left
    /// over from interrupted runs, and dispatches the rest in one batch
    /// after a cost preview.
    Index {
        /// Path to the exported `conversations.json`.
        export: PathBuf,

        /// Skip the cost confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Search the indexed archive.
    ///
    /// Embeds the query, ranks every cached chunk by cosine similarity, and
    /// prints the matching conversations. Identical queries are served from
    /// the on-disk result cache without re-embedding.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of distinct conversations to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Resume an indexed conversation.
    ///
    /// Rebuilds the stored transcript as model context and continues it
    /// interactively; new turns are appended to the index.
    Chat {
        /// Conversation id (as printed by `rcl search`).
        id: String,

        /// Skip the per-turn cost confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Show index and cache counters.
    Stats,
}

fn build_dispatcher(
    config: &Config,
    kind: ModelKind,
    tokenizer: Arc<Tokenizer>,
    store: Arc<dyn BlobStore>,
) -> Result<Arc<Dispatcher>> {
    let spec = config.model(kind).to_spec();
    let timeout = config.dispatch.timeout_secs;
    let endpoint: Arc<dyn ModelEndpoint> = match kind {
        ModelKind::Chat => Arc::new(ChatEndpoint::new(spec.clone(), timeout)?),
        ModelKind::Embedding => Arc::new(EmbeddingEndpoint::new(spec.clone(), timeout)?),
    };
    let limiter = RateLimiter::for_spec(&spec);
    Ok(Arc::new(Dispatcher::new(
        endpoint,
        limiter,
        tokenizer,
        store,
        RetryPolicy::from_config(&config.dispatch),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::open(&cfg.store.path).await?;
            store.close().await;
            println!("Store initialized at {}.", cfg.store.path.display());
        }
        Commands::Index { export, yes } => {
            let store: Arc<dyn BlobStore> = Arc::new(SqliteStore::open(&cfg.store.path).await?);
            let tokenizer = Arc::new(Tokenizer::new()?);
            let dispatcher = build_dispatcher(
                &cfg,
                ModelKind::Embedding,
                tokenizer.clone(),
                store.clone(),
            )?;
            ingest::run_index(&cfg, store, dispatcher, &tokenizer, &export, yes).await?;
        }
        Commands::Search { query, limit } => {
            let store: Arc<dyn BlobStore> = Arc::new(SqliteStore::open(&cfg.store.path).await?);
            let tokenizer = Arc::new(Tokenizer::new()?);
            let dispatcher =
                build_dispatcher(&cfg, ModelKind::Embedding, tokenizer, store.clone())?;

            let chunk_cache = cache::ChunkCache::load(store.as_ref()).await?;
            let index = ingest::load_index(store.as_ref()).await?;
            let limit = limit.unwrap_or(cfg.search.result_limit);

            let engine = SearchEngine::new(dispatcher, store);
            let result = engine.search(&chunk_cache, &query, limit).await?;

            if result.conversation_ids.is_empty() {
                println!("No results.");
                return Ok(());
            }

            println!("Results for \"{query}\":");
            for (i, id) in result.conversation_ids.iter().enumerate() {
                match index.get(id) {
                    Some(conversation) => {
                        let date = chrono::DateTime::from_timestamp(conversation.created_at, 0)
                            .map(|dt| dt.format("%Y-%m-%d").to_string())
                            .unwrap_or_default();
                        println!("{}. {}", i + 1, conversation.title);
                        println!("    created: {date}");
                        if let Some(ref url) = conversation.url {
                            println!("    url: {url}");
                        }
                        println!("    id: {id}");
                    }
                    None => println!("{}. (missing from index) id: {id}", i + 1),
                }
                println!();
            }
        }
        Commands::Chat { id, yes } => {
            let store: Arc<dyn BlobStore> = Arc::new(SqliteStore::open(&cfg.store.path).await?);
            let tokenizer = Arc::new(Tokenizer::new()?);
            let dispatcher =
                build_dispatcher(&cfg, ModelKind::Chat, tokenizer.clone(), store.clone())?;
            chat::run_chat(&cfg, store, dispatcher, &tokenizer, &id, yes).await?;
        }
        Commands::Stats => {
            let store = SqliteStore::open(&cfg.store.path).await?;
            ingest::run_stats(&store).await?;
            store.close().await;
        }
    }

    Ok(())
}
