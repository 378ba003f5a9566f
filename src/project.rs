//! Project: one tenant's config turned into live resources.
//!
//! [`Project::build`] validates the config, then constructs the model table,
//! the checkpoint saver, the chat-history factory and the document store, in
//! that order. Any failure aborts the whole construction; a `Project` value
//! always has every resource its config asks for.
//!
//! With an in-process vector backend, indexing starts in the background as
//! soon as the project is built. [`Project::indexing`] exposes the
//! [`IndexingTask`] so callers can wait for it.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use grox_core::GroxError;

use crate::backends::checkpoint::CheckpointSaver;
use crate::backends::history::ChatHistoryFactory;
use crate::backends::BackendFactory;
use crate::config::{load_project_config, BackendSpec, ProjectConfig};
use crate::documents::store::{DocumentStore, IndexingReport, IndexingTask};
use crate::models::ModelTable;

/// Registry key of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProjectKey {
    pub tenant_id: String,
    pub project_code: String,
}

impl ProjectKey {
    pub fn new(tenant_id: impl Into<String>, project_code: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_code: project_code.into(),
        }
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.project_code)
    }
}

pub struct Project {
    key: ProjectKey,
    config: ProjectConfig,
    models: ModelTable,
    checkpoint: Option<Arc<dyn CheckpointSaver>>,
    history: ChatHistoryFactory,
    documents: Option<Arc<DocumentStore>>,
    indexing: Option<IndexingTask>,
}

impl Project {
    pub async fn build(
        tenant_id: &str,
        config: ProjectConfig,
        backends: &BackendFactory,
        indexing_concurrency: usize,
    ) -> Result<Self> {
        config.validate()?;
        let key = ProjectKey::new(tenant_id, config.project_code());
        let infra = &config.infrastructure;

        let models = ModelTable::build(infra)?;

        let checkpoint = match &infra.backends.checkpoint {
            Some(cfg) => Some(
                backends
                    .build_checkpoint_saver(&key.tenant_id, &key.project_code, cfg)
                    .await?,
            ),
            None => None,
        };

        let history = backends
            .build_chat_history_factory(
                &key.tenant_id,
                &key.project_code,
                infra.backends.history.as_ref(),
            )
            .await?;

        let mut documents = None;
        let mut indexing = None;
        if !config.orchestration.documents.is_empty() {
            let embedder = models
                .default_embedder()
                .ok_or_else(|| GroxError::config("document collections require defaults.embedding"))?;
            let vector_cfg = infra
                .backends
                .vector
                .as_ref()
                .ok_or_else(|| GroxError::config("document collections require backends.vector"))?;

            let store = Arc::new(
                backends
                    .build_document_store(
                        embedder,
                        &key.tenant_id,
                        &key.project_code,
                        &config.orchestration.documents,
                        vector_cfg,
                    )
                    .await?,
            );
            if vector_cfg.resolve()? == BackendSpec::Memory {
                indexing = Some(store.spawn_indexing(indexing_concurrency));
            }
            documents = Some(store);
        }

        tracing::info!(
            tenant_id = %key.tenant_id,
            project_code = %key.project_code,
            models = models.names().len(),
            checkpoint = checkpoint.is_some(),
            history = history.kind(),
            collections = documents.as_ref().map(|d| d.list_collections().len()).unwrap_or(0),
            "project_built"
        );

        Ok(Self {
            key,
            config,
            models,
            checkpoint,
            history,
            documents,
            indexing,
        })
    }

    /// Load a project document from disk and build it.
    pub async fn load(
        tenant_id: &str,
        path: &Path,
        backends: &BackendFactory,
        indexing_concurrency: usize,
    ) -> Result<Self> {
        let config = load_project_config(path)?;
        Self::build(tenant_id, config, backends, indexing_concurrency)
            .await
            .with_context(|| format!("Failed to build project from {}", path.display()))
    }

    pub fn key(&self) -> &ProjectKey {
        &self.key
    }

    pub fn tenant_id(&self) -> &str {
        &self.key.tenant_id
    }

    pub fn project_code(&self) -> &str {
        &self.key.project_code
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn checkpoint_saver(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpoint.as_ref()
    }

    pub fn history(&self) -> &ChatHistoryFactory {
        &self.history
    }

    pub fn documents(&self) -> Option<&Arc<DocumentStore>> {
        self.documents.as_ref()
    }

    /// The document store, or `CollectionNotFound(name)` when the project
    /// has no collections.
    pub fn require_documents(&self, collection: &str) -> Result<&Arc<DocumentStore>, GroxError> {
        self.documents
            .as_ref()
            .ok_or_else(|| GroxError::CollectionNotFound(collection.to_string()))
    }

    pub fn indexing(&self) -> Option<&IndexingTask> {
        self.indexing.as_ref()
    }

    /// Wait for background indexing, if any was started.
    pub async fn wait_until_indexed(&self) -> Result<Option<Arc<IndexingReport>>> {
        match &self.indexing {
            Some(task) => Ok(Some(task.wait().await?)),
            None => Ok(None),
        }
    }

    pub fn summary(&self) -> ProjectSummary {
        let backends = &self.config.infrastructure.backends;
        ProjectSummary {
            tenant_id: self.key.tenant_id.clone(),
            project_code: self.key.project_code.clone(),
            title: self.config.metadata.title.clone(),
            workspace: self.config.metadata.workspace.clone(),
            models: self.models.names(),
            collections: self
                .documents
                .as_ref()
                .map(|d| d.list_collections().iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            checkpoint_backend: backends.checkpoint.as_ref().map(|b| b.backend.clone()),
            history_backend: self.history.kind().to_string(),
            vector_backend: backends.vector.as_ref().map(|b| b.backend.clone()),
        }
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("key", &self.key)
            .field("history", &self.history)
            .field("documents", &self.documents)
            .finish()
    }
}

/// Serializable description of a registered project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub tenant_id: String,
    pub project_code: String,
    pub title: String,
    pub workspace: String,
    pub models: Vec<String>,
    pub collections: Vec<String>,
    pub checkpoint_backend: Option<String>,
    pub history_backend: String,
    pub vector_backend: Option<String>,
}
