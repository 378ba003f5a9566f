//! SQLite-backed checkpoint, chat-history and vector stores.
//!
//! All three share one pool per database URL (see
//! [`BackendFactory`](super::BackendFactory)) and live in the same schema:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `checkpoints` | Engine states per `(namespace, thread_id)` |
//! | `chat_messages` | Messages per `(namespace, session_id)` |
//! | `vectors` | Embeddings per `(namespace, collection, id)` |
//!
//! Rows carry an optional `expires_at` (unix seconds) derived from the
//! backend TTL; expired rows are invisible to reads and pruned on write.
//!
//! # Write-Ahead Logging (WAL)
//!
//! WAL mode is enabled for all connections, which allows concurrent
//! readers and a single writer without blocking.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use grox_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use grox_core::models::{IndexedDocument, Metadata, VectorMatch, VectorRecord};
use grox_core::store::VectorStore;

use super::checkpoint::{Checkpoint, CheckpointSaver};
use super::history::{ChatHistory, ChatMessage, Role};

/// Open a pool to `url` and ensure the schema exists.
///
/// - Creates the database file and parent directories if they don't exist.
/// - Enables WAL journal mode; `sync` selects `synchronous = FULL`.
/// - Returns a pool with up to 5 connections.
pub async fn connect(url: &str, sync: bool) -> Result<SqlitePool> {
    if let Some(parent) = database_path(url).and_then(|p| p.parent().map(Path::to_path_buf)) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(if sync {
            SqliteSynchronous::Full
        } else {
            SqliteSynchronous::Normal
        });

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// `url` without its query string, safe for errors and logs.
pub fn redacted_target(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// File path of a `sqlite:` URL, if it names a file.
fn database_path(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(Path::new(path))
    }
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            state_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            namespace TEXT NOT NULL,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (namespace, collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(namespace, thread_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(namespace, session_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn expires_at(ttl_seconds: Option<u64>) -> Option<i64> {
    ttl_seconds.map(|ttl| Utc::now().timestamp().saturating_add(ttl.min(i64::MAX as u64) as i64))
}

/// Delete rows of `table` whose TTL has lapsed.
async fn prune_expired(pool: &SqlitePool, table: &str) -> Result<u64> {
    let result = sqlx::query(&format!(
        "DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= ?"
    ))
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// ============ Checkpoints ============

pub struct SqliteCheckpointSaver {
    pool: SqlitePool,
    namespace: String,
    ttl_seconds: Option<u64>,
}

impl SqliteCheckpointSaver {
    pub fn new(pool: SqlitePool, namespace: impl Into<String>, ttl_seconds: Option<u64>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            ttl_seconds,
        }
    }

}

fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let state_json: String = row.get("state_json");
    Ok(Checkpoint {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        state: serde_json::from_str(&state_json).context("Corrupt checkpoint state")?,
        created_at: from_ts(row.get("created_at")),
    })
}

#[async_trait]
impl CheckpointSaver for SqliteCheckpointSaver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn put(&self, thread_id: &str, state: Value) -> Result<Checkpoint> {
        prune_expired(&self.pool, "checkpoints").await?;
        let checkpoint = Checkpoint::new(thread_id, state);
        sqlx::query(
            r#"
            INSERT INTO checkpoints (id, namespace, thread_id, state_json, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.id)
        .bind(&self.namespace)
        .bind(thread_id)
        .bind(serde_json::to_string(&checkpoint.state)?)
        .bind(checkpoint.created_at.timestamp())
        .bind(expires_at(self.ttl_seconds))
        .execute(&self.pool)
        .await?;
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT id, thread_id, state_json, created_at FROM checkpoints
            WHERE namespace = ? AND thread_id = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY rowid DESC LIMIT 1
            "#,
        )
        .bind(&self.namespace)
        .bind(thread_id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, thread_id, state_json, created_at FROM checkpoints
            WHERE namespace = ? AND thread_id = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY rowid ASC
            "#,
        )
        .bind(&self.namespace)
        .bind(thread_id)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE namespace = ? AND thread_id = ?")
            .bind(&self.namespace)
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

// ============ Chat history ============

pub struct SqliteChatHistory {
    pool: SqlitePool,
    namespace: String,
    session_id: String,
    ttl_seconds: Option<u64>,
}

impl SqliteChatHistory {
    pub fn new(
        pool: SqlitePool,
        namespace: impl Into<String>,
        session_id: impl Into<String>,
        ttl_seconds: Option<u64>,
    ) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            session_id: session_id.into(),
            ttl_seconds,
        }
    }
}

#[async_trait]
impl ChatHistory for SqliteChatHistory {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn add_message(&self, message: ChatMessage) -> Result<()> {
        prune_expired(&self.pool, "chat_messages").await?;
        sqlx::query(
            r#"
            INSERT INTO chat_messages (namespace, session_id, role, content, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.namespace)
        .bind(&self.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.timestamp())
        .bind(expires_at(self.ttl_seconds))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages(&self) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at FROM chat_messages
            WHERE namespace = ? AND session_id = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY id ASC
            "#,
        )
        .bind(&self.namespace)
        .bind(&self.session_id)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(ChatMessage {
                    role: Role::parse(&role)
                        .ok_or_else(|| anyhow::anyhow!("Unknown message role '{}'", role))?,
                    content: row.get("content"),
                    created_at: from_ts(row.get("created_at")),
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM chat_messages WHERE namespace = ? AND session_id = ?")
            .bind(&self.namespace)
            .bind(&self.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ Vectors ============

/// Persistent vector index for one collection.
///
/// Vectors are stored as little-endian f32 BLOBs and scored with a
/// brute-force cosine scan, so it suits collections of a few thousand
/// snippets.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    namespace: String,
    collection: String,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteVectorStore {
    pub fn new(
        pool: SqlitePool,
        namespace: impl Into<String>,
        collection: impl Into<String>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            collection: collection.into(),
            embedder,
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vectors (namespace, collection, id, text, metadata_json, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, collection, id) DO UPDATE SET
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&self.namespace)
            .bind(&self.collection)
            .bind(&record.id)
            .bind(&record.text)
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
            ids.push(record.id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, metadata_json, embedding FROM vectors
            WHERE namespace = ? AND collection = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let stored = blob_to_vec(&blob);
            let metadata_json: String = row.get("metadata_json");
            let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
            matches.push(VectorMatch {
                document: IndexedDocument::new(
                    row.get::<String, _>("id"),
                    row.get::<String, _>("text"),
                    metadata,
                ),
                score: cosine_similarity(vector, &stored),
                vector: stored,
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE namespace = ? AND collection = ?")
                .bind(&self.namespace)
                .bind(&self.collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grox_core::embedding::HashingEmbedder;
    use grox_core::hash::content_hash;
    use serde_json::json;
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let url = format!("sqlite://{}", tmp.path().join("nested/grox.db").display());
        connect(&url, false).await.unwrap()
    }

    #[test]
    fn test_database_path() {
        assert_eq!(
            database_path("sqlite://data/grox.db"),
            Some(Path::new("data/grox.db"))
        );
        assert_eq!(database_path("sqlite::memory:"), None);
        assert_eq!(database_path("redis://localhost"), None);
    }

    #[test]
    fn test_redacted_target_drops_query() {
        assert_eq!(redacted_target("sqlite://data/grox.db?mode=rwc"), "sqlite://data/grox.db");
        assert_eq!(redacted_target("sqlite::memory:"), "sqlite::memory:");
    }

    #[tokio::test]
    async fn test_checkpoints_roundtrip_and_namespace() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let a = SqliteCheckpointSaver::new(pool.clone(), "acme:support", None);
        let b = SqliteCheckpointSaver::new(pool, "globex:support", None);

        a.put("t", json!({"n": 1})).await.unwrap();
        a.put("t", json!({"n": 2})).await.unwrap();
        b.put("t", json!({"n": 9})).await.unwrap();

        assert_eq!(a.latest("t").await.unwrap().unwrap().state, json!({"n": 2}));
        assert_eq!(a.list("t").await.unwrap().len(), 2);
        assert_eq!(a.delete_thread("t").await.unwrap(), 2);
        assert!(a.latest("t").await.unwrap().is_none());
        assert_eq!(b.list("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        sqlx::query(
            "INSERT INTO checkpoints (id, namespace, thread_id, state_json, created_at, expires_at) \
             VALUES ('old', 'ns', 't', '{}', 0, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let saver = SqliteCheckpointSaver::new(pool, "ns", Some(3600));
        assert!(saver.latest("t").await.unwrap().is_none());
        saver.put("t", json!("fresh")).await.unwrap();
        assert_eq!(saver.list("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_per_session() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let s1 = SqliteChatHistory::new(pool.clone(), "ns", "s1", Some(60));
        let s2 = SqliteChatHistory::new(pool, "ns", "s2", None);

        s1.add_message(ChatMessage::new(Role::User, "hello"))
            .await
            .unwrap();
        s1.add_message(ChatMessage::new(Role::Assistant, "hi"))
            .await
            .unwrap();

        let msgs = s1.messages().await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "hello");
        assert!(s2.messages().await.unwrap().is_empty());

        s1.clear().await.unwrap();
        assert!(s1.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_write_prunes_expired_messages() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        sqlx::query(
            "INSERT INTO chat_messages (namespace, session_id, role, content, created_at, expires_at) \
             VALUES ('other', 'old', 'user', 'stale', 0, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let history = SqliteChatHistory::new(pool.clone(), "ns", "s1", Some(60));
        for text in ["a", "b", "c"] {
            history
                .add_message(ChatMessage::new(Role::User, text))
                .await
                .unwrap();
        }

        let expired: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_messages WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(Utc::now().timestamp())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(expired, 0);
        assert_eq!(history.messages().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_vector_upsert_is_keyed_by_id() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let store = SqliteVectorStore::new(
            pool,
            "acme:support",
            "faq",
            Arc::new(HashingEmbedder::new("local-hash", 64)),
        );

        let texts = vec!["refund policy".to_string(), "shipping times".to_string()];
        let ids: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let metas = vec![Metadata::new(); 2];
        store.add_texts(&texts, &metas, &ids).await.unwrap();
        store.add_texts(&texts, &metas, &ids).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let hits = store.similarity_search_with_score("refund", 2).await.unwrap();
        assert_eq!(hits[0].document.text, "refund policy");
        assert!(hits[0].score >= hits[1].score);
    }
}
