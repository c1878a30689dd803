//! Storage abstraction for chat-recall.
//!
//! The [`BlobStore`] trait is the persistence contract for the whole
//! pipeline: one logical JSON record per key. The chunk cache, the request
//! backlog, the search-result cache, and the conversation index all live
//! behind it. Backends: SQLite for the CLI, in-memory for tests.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

/// Abstract key-value record store.
///
/// Implementations must be `Send + Sync` to be shared across concurrent
/// operations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read one record; `None` on miss.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write one record, replacing any previous value.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// List keys under a prefix, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize a JSON record.
///
/// A corrupt record is treated as a miss (and logged), not an error: the
/// caller rebuilds state and the next write repairs the store.
pub async fn read_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<Option<T>> {
    let Some(bytes) = store.read(key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "malformed record, treating as empty");
            Ok(None)
        }
    }
}

/// Serialize and write a JSON record.
pub async fn write_json<T: Serialize>(store: &dyn BlobStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.write(key, &bytes).await
}

// ============ SQLite backend ============

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database and run the schema migration.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO blobs (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(bytes)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM blobs WHERE key LIKE ? || '%' ORDER BY key")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

// ============ In-memory backend ============

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().expect("store lock poisoned");
        Ok(blobs.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("store lock poisoned");
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.lock().expect("store lock poisoned");
        let mut keys: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.read("missing").await.unwrap().is_none());

        store.write("a/1", b"one").await.unwrap();
        store.write("a/2", b"two").await.unwrap();
        store.write("b/1", b"three").await.unwrap();

        assert_eq!(store.read("a/1").await.unwrap().unwrap(), b"one");
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("recall.db")).await.unwrap();

        store.write("index", b"{}").await.unwrap();
        store.write("index", b"{\"a\":1}").await.unwrap();

        assert_eq!(store.read("index").await.unwrap().unwrap(), b"{\"a\":1}");
        assert!(store.read("other").await.unwrap().is_none());
        assert_eq!(store.list("ind").await.unwrap(), vec!["index"]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_malformed_json_reads_as_empty() {
        let store = MemoryStore::new();
        store.write("cache", b"{not json").await.unwrap();

        let value: Option<Vec<String>> = read_json(&store, "cache").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_json_helpers_roundtrip() {
        let store = MemoryStore::new();
        write_json(&store, "nums", &vec![1, 2, 3]).await.unwrap();
        let value: Option<Vec<i32>> = read_json(&store, "nums").await.unwrap();
        assert_eq!(value.unwrap(), vec![1, 2, 3]);
    }
}
