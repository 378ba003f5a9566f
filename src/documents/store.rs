//! Document Store: a project's collections and their vector indexes.
//!
//! Collections are loaded once, eagerly. Vector indexes are created lazily,
//! one per collection, through the injected [`VectorStoreFactory`] and then
//! cached for the life of the store.
//!
//! Indexing upserts every snippet under its content hash, so re-indexing
//! identical text overwrites rather than duplicates.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use grox_core::hash::content_hash;
use grox_core::retrieval::DocumentRetrieval;
use grox_core::store::VectorStore;
use grox_core::{GroxError, Metadata};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, Span};

use super::{insert_unique, load_collections, Collection};

/// Creates the vector index for a named collection.
pub type VectorStoreFactory = Arc<dyn Fn(&str) -> Arc<dyn VectorStore> + Send + Sync>;

pub struct DocumentStore {
    collections: BTreeMap<String, Collection>,
    factory: VectorStoreFactory,
    indexes: Mutex<HashMap<String, Arc<dyn VectorStore>>>,
    span: Span,
}

impl DocumentStore {
    /// Load every document file. Fails on duplicate collection names.
    pub fn load(paths: &[PathBuf], factory: VectorStoreFactory, span: Span) -> Result<Self> {
        let collections = load_collections(paths)?;
        span.in_scope(|| {
            tracing::info!(
                files = paths.len(),
                collections = collections.len(),
                "collections_loaded"
            )
        });
        Ok(Self {
            collections,
            factory,
            indexes: Mutex::new(HashMap::new()),
            span,
        })
    }

    pub fn from_collections(
        collections: Vec<Collection>,
        factory: VectorStoreFactory,
        span: Span,
    ) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for c in collections {
            insert_unique(&mut by_name, c)?;
        }
        Ok(Self {
            collections: by_name,
            factory,
            indexes: Mutex::new(HashMap::new()),
            span,
        })
    }

    pub fn find_collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    /// Collections ordered by name.
    pub fn list_collections(&self) -> Vec<&Collection> {
        self.collections.values().collect()
    }

    fn require(&self, name: &str) -> Result<&Collection, GroxError> {
        self.collections
            .get(name)
            .ok_or_else(|| GroxError::CollectionNotFound(name.to_string()))
    }

    /// The collection's vector index, created on first access.
    pub fn get_vector_store(&self, name: &str) -> Result<Arc<dyn VectorStore>> {
        self.require(name)?;
        let mut indexes = self.indexes.lock().expect("index cache lock poisoned");
        let store = indexes
            .entry(name.to_string())
            .or_insert_with(|| (self.factory)(name));
        Ok(store.clone())
    }

    pub fn as_retrieval(&self, name: &str) -> Result<DocumentRetrieval> {
        Ok(DocumentRetrieval::new(self.get_vector_store(name)?, name))
    }

    /// Upsert every snippet of `name` keyed by content hash.
    ///
    /// Returns the number of snippets processed, which can exceed the number
    /// of distinct stored entries when snippets repeat.
    pub async fn index_documents(&self, name: &str) -> Result<usize> {
        let collection = self.require(name)?;
        let store = self.get_vector_store(name)?;

        async move {
            let mut inserted = 0;
            for entry in &collection.data {
                if entry.documents.is_empty() {
                    continue;
                }
                let ids: Vec<String> = entry.documents.iter().map(|t| content_hash(t)).collect();
                let metadatas: Vec<Metadata> = ids
                    .iter()
                    .map(|id| {
                        let mut meta = entry.metadata.clone();
                        meta.insert("id".to_string(), serde_json::Value::String(id.clone()));
                        meta
                    })
                    .collect();
                store.add_texts(&entry.documents, &metadatas, &ids).await?;
                inserted += entry.documents.len();
            }
            tracing::info!(collection = %name, inserted, "documents_indexed");
            Ok(inserted)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Index every collection in the background, at most `concurrency` at
    /// a time.
    pub fn spawn_indexing(self: &Arc<Self>, concurrency: usize) -> IndexingTask {
        let (tx, rx) = watch::channel(None);
        let store = self.clone();
        let names: Vec<String> = self.collections.keys().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(
            async move {
                let mut set = JoinSet::new();
                for name in names {
                    let store = store.clone();
                    let semaphore = semaphore.clone();
                    set.spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        let outcome = store.index_documents(&name).await;
                        (name, outcome)
                    });
                }

                let mut report = IndexingReport::default();
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((name, Ok(indexed))) => report.collections.push(CollectionReport {
                            collection: name,
                            indexed,
                            error: None,
                        }),
                        Ok((name, Err(e))) => {
                            let reason = format!("{:#}", e);
                            tracing::error!(collection = %name, error = %reason, "indexing_failed");
                            report.collections.push(CollectionReport {
                                collection: name,
                                indexed: 0,
                                error: Some(reason),
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "indexing_task_aborted"),
                    }
                }
                report.collections.sort_by(|a, b| a.collection.cmp(&b.collection));
                tracing::info!(
                    collections = report.collections.len(),
                    indexed = report.total_indexed(),
                    "indexing_complete"
                );
                // Nobody may be waiting; that is fine.
                let _ = tx.send(Some(Arc::new(report)));
            }
            .instrument(self.span.clone()),
        );

        IndexingTask { rx }
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============ Background indexing ============

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub indexed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexingReport {
    pub collections: Vec<CollectionReport>,
}

impl IndexingReport {
    pub fn total_indexed(&self) -> usize {
        self.collections.iter().map(|c| c.indexed).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CollectionReport> {
        self.collections.iter().filter(|c| c.error.is_some())
    }
}

/// Handle on a background indexing run. Cloneable; every clone observes
/// the same completion.
#[derive(Clone)]
pub struct IndexingTask {
    rx: watch::Receiver<Option<Arc<IndexingReport>>>,
}

impl IndexingTask {
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> Result<Arc<IndexingReport>> {
        let mut rx = self.rx.clone();
        let done = rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| anyhow::anyhow!("indexing task ended without a report"))?;
        done.clone()
            .ok_or_else(|| anyhow::anyhow!("indexing task ended without a report"))
    }
}

impl std::fmt::Debug for IndexingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingTask")
            .field("finished", &self.is_finished())
            .finish()
    }
}
