//! Backend Factory: declarative backend config → live backend handle.
//!
//! | Builder | Returns |
//! |---------|---------|
//! | [`BackendFactory::build_checkpoint_saver`] | `Arc<dyn CheckpointSaver>` |
//! | [`BackendFactory::build_chat_history_factory`] | [`ChatHistoryFactory`] |
//! | [`BackendFactory::build_document_store`] | [`DocumentStore`] |
//!
//! Backend kinds are `memory` and `sqlite`; anything else fails with
//! [`GroxError::UnsupportedBackend`]. SQLite pools are memoized by
//! [`ConnectionKey`] in a [`ConnectionCache`]: racing first resolutions of
//! the same key construct one pool, and a failed construction leaves the
//! slot empty so a later call can retry.

pub mod checkpoint;
pub mod history;
pub mod sqlite;

use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use grox_core::embedding::EmbeddingProvider;
use grox_core::store::memory::InMemoryVectorStore;
use grox_core::store::VectorStore;
use grox_core::GroxError;
use sqlx::SqlitePool;
use tokio::sync::OnceCell;

use crate::config::{BackendConfig, BackendSpec, SecretString};
use crate::documents::store::{DocumentStore, VectorStoreFactory};

use checkpoint::{CheckpointSaver, InMemoryCheckpointSaver, MemoryCheckpointTable};
use history::ChatHistoryFactory;
use sqlite::{SqliteCheckpointSaver, SqliteVectorStore};

// ============ Connection memo ============

/// Identity of a live connection: target plus sorted auxiliary options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    target: String,
    options: Vec<(String, String)>,
}

impl ConnectionKey {
    pub fn new(target: impl Into<String>, options: &[(&str, String)]) -> Self {
        let mut options: Vec<(String, String)> = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        options.sort();
        Self {
            target: target.into(),
            options,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Process-wide memo of live connections.
pub struct ConnectionCache<K, C> {
    slots: Mutex<HashMap<K, Arc<OnceCell<C>>>>,
}

impl<K, C> Default for ConnectionCache<K, C> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, C> ConnectionCache<K, C>
where
    K: Eq + Hash + Clone,
    C: Clone,
{
    /// Return the cached connection for `key`, or build it with `connect`.
    ///
    /// Concurrent callers for one key wait on a single construction. If it
    /// fails, the error goes to the caller that ran it and the slot stays
    /// empty.
    pub async fn get_or_connect<F, Fut>(&self, key: &K, connect: F) -> Result<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let cell = {
            let mut slots = self.slots.lock().expect("connection cache lock poisoned");
            slots.entry(key.clone()).or_default().clone()
        };
        cell.get_or_try_init(connect).await.cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .expect("connection cache lock poisoned")
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============ Factory ============

/// Handle identity for checkpoint savers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SaverKey {
    kind: &'static str,
    target: Option<String>,
    tenant_id: String,
    project_code: String,
    ttl_seconds: Option<u64>,
}

/// Builds live backends from [`BackendConfig`]s. One per process.
#[derive(Default)]
pub struct BackendFactory {
    pools: ConnectionCache<ConnectionKey, SqlitePool>,
    savers: Mutex<HashMap<SaverKey, Arc<dyn CheckpointSaver>>>,
    memory_checkpoints: Arc<MemoryCheckpointTable>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> &ConnectionCache<ConnectionKey, SqlitePool> {
        &self.pools
    }

    async fn sqlite_pool(&self, url: &SecretString, sync: bool) -> Result<SqlitePool> {
        let key = ConnectionKey::new(url.expose_secret(), &[("sync", sync.to_string())]);
        self.pools
            .get_or_connect(&key, || async {
                tracing::info!(kind = "sqlite", sync, "backend_connect");
                sqlite::connect(url.expose_secret(), sync)
                    .await
                    .map_err(|e| {
                        anyhow::Error::from(GroxError::connection(
                            sqlite::redacted_target(url.expose_secret()),
                            format!("{:#}", e),
                        ))
                    })
            })
            .await
    }

    pub async fn build_checkpoint_saver(
        &self,
        tenant_id: &str,
        project_code: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn CheckpointSaver>> {
        let spec = config.resolve()?;
        let key = SaverKey {
            kind: spec.kind(),
            target: match &spec {
                BackendSpec::Memory => None,
                BackendSpec::Sqlite { url, .. } => Some(url.expose_secret().to_string()),
            },
            tenant_id: tenant_id.to_string(),
            project_code: project_code.to_string(),
            ttl_seconds: spec.ttl_seconds(),
        };
        if let Some(saver) = self
            .savers
            .lock()
            .expect("saver cache lock poisoned")
            .get(&key)
        {
            return Ok(saver.clone());
        }

        let namespace = checkpoint::namespace(tenant_id, project_code);
        let saver: Arc<dyn CheckpointSaver> = match spec {
            BackendSpec::Memory => Arc::new(InMemoryCheckpointSaver::new(
                namespace,
                self.memory_checkpoints.clone(),
            )),
            BackendSpec::Sqlite {
                url,
                ttl_seconds,
                sync,
            } => {
                let pool = self.sqlite_pool(&url, sync).await?;
                Arc::new(SqliteCheckpointSaver::new(pool, namespace, ttl_seconds))
            }
        };

        let mut savers = self.savers.lock().expect("saver cache lock poisoned");
        Ok(savers.entry(key).or_insert(saver).clone())
    }

    /// Session-keyed history factory. `None` yields the no-op factory.
    pub async fn build_chat_history_factory(
        &self,
        tenant_id: &str,
        project_code: &str,
        config: Option<&BackendConfig>,
    ) -> Result<ChatHistoryFactory> {
        let Some(config) = config else {
            return Ok(ChatHistoryFactory::Noop);
        };
        match config.resolve()? {
            BackendSpec::Memory => Ok(ChatHistoryFactory::memory()),
            BackendSpec::Sqlite {
                url,
                ttl_seconds,
                sync,
            } => Ok(ChatHistoryFactory::Sqlite {
                namespace: checkpoint::namespace(tenant_id, project_code),
                pool: self.sqlite_pool(&url, sync).await?,
                ttl_seconds,
            }),
        }
    }

    /// Load `document_paths` into a [`DocumentStore`] whose collections are
    /// indexed by the `vector_config` backend.
    pub async fn build_document_store(
        &self,
        embedder: Arc<dyn EmbeddingProvider>,
        tenant_id: &str,
        project_code: &str,
        document_paths: &[PathBuf],
        vector_config: &BackendConfig,
    ) -> Result<DocumentStore> {
        let namespace = checkpoint::namespace(tenant_id, project_code);
        let factory: VectorStoreFactory = match vector_config.resolve()? {
            BackendSpec::Memory => Arc::new(move |_collection: &str| {
                Arc::new(InMemoryVectorStore::new(embedder.clone())) as Arc<dyn VectorStore>
            }),
            BackendSpec::Sqlite { url, sync, .. } => {
                let pool = self.sqlite_pool(&url, sync).await?;
                Arc::new(move |collection: &str| {
                    Arc::new(SqliteVectorStore::new(
                        pool.clone(),
                        namespace.clone(),
                        collection,
                        embedder.clone(),
                    )) as Arc<dyn VectorStore>
                })
            }
        };

        let span = tracing::info_span!(
            "documents",
            tenant_id = %tenant_id,
            project_code = %project_code
        );
        DocumentStore::load(document_paths, factory, span)
    }
}
