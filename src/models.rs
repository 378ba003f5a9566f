//! Model handles resolved from a project's model table.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use grox_core::embedding::EmbeddingProvider;
use serde::Serialize;

use crate::config::{InfrastructureConfig, ModelConfig, ModelKind, ModelProvider};
use crate::embedding::create_embedder;

/// Opaque chat-model binding handed to the graph engine.
#[derive(Debug, Clone, Serialize)]
pub struct ChatModel {
    pub name: String,
    pub provider: ModelProvider,
    pub model: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone)]
pub enum ModelHandle {
    Chat(ChatModel),
    Embedding(Arc<dyn EmbeddingProvider>),
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelHandle::Chat(m) => f.debug_tuple("Chat").field(m).finish(),
            ModelHandle::Embedding(e) => f.debug_tuple("Embedding").field(&e.model_name()).finish(),
        }
    }
}

/// Live handles for every model a project declares.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    handles: BTreeMap<String, ModelHandle>,
    default_chat: Option<String>,
    default_embedding: Option<String>,
}

impl ModelTable {
    /// Build every declared model. Assumes the config passed validation.
    pub fn build(infra: &InfrastructureConfig) -> Result<Self> {
        let mut handles = BTreeMap::new();
        for (name, cfg) in &infra.models {
            let handle = build_handle(name, cfg)
                .with_context(|| format!("Failed to initialise model '{}'", name))?;
            handles.insert(name.clone(), handle);
        }
        Ok(Self {
            handles,
            default_chat: infra.defaults.chat.clone(),
            default_embedding: infra.defaults.embedding.clone(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModelHandle> {
        self.handles.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn default_chat(&self) -> Option<&ChatModel> {
        match self.handles.get(self.default_chat.as_deref()?)? {
            ModelHandle::Chat(m) => Some(m),
            ModelHandle::Embedding(_) => None,
        }
    }

    pub fn default_embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        match self.handles.get(self.default_embedding.as_deref()?)? {
            ModelHandle::Embedding(e) => Some(e.clone()),
            ModelHandle::Chat(_) => None,
        }
    }
}

fn build_handle(name: &str, cfg: &ModelConfig) -> Result<ModelHandle> {
    Ok(match cfg.kind {
        ModelKind::Chat => ModelHandle::Chat(ChatModel {
            name: name.to_string(),
            provider: cfg.provider,
            model: cfg.model.clone(),
            options: cfg.options.clone(),
        }),
        ModelKind::Embedding => ModelHandle::Embedding(create_embedder(cfg)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelDefaults;

    #[test]
    fn test_defaults_resolve_by_kind() {
        let mut infra = InfrastructureConfig::default();
        infra.models.insert(
            "chat".into(),
            ModelConfig {
                provider: ModelProvider::Openai,
                model: "gpt-4o-mini".into(),
                kind: ModelKind::Chat,
                dims: None,
                options: Default::default(),
            },
        );
        infra.models.insert(
            "embed".into(),
            ModelConfig {
                provider: ModelProvider::Local,
                model: "local-hash".into(),
                kind: ModelKind::Embedding,
                dims: Some(32),
                options: Default::default(),
            },
        );
        infra.defaults = ModelDefaults {
            chat: Some("chat".into()),
            embedding: Some("embed".into()),
        };

        let table = ModelTable::build(&infra).unwrap();
        assert_eq!(table.default_chat().unwrap().model, "gpt-4o-mini");
        assert_eq!(table.default_embedder().unwrap().dims(), 32);
        assert_eq!(table.names(), vec!["chat", "embed"]);
    }

    #[test]
    fn test_empty_table_has_no_defaults() {
        let table = ModelTable::build(&InfrastructureConfig::default()).unwrap();
        assert!(table.default_chat().is_none());
        assert!(table.default_embedder().is_none());
    }
}
