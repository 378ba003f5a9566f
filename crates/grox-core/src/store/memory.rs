//! In-memory [`VectorStore`] implementation.
//!
//! Uses a `HashMap` keyed by record id behind `std::sync::RwLock`, so an
//! upsert with an existing id overwrites in place. Queries are brute-force
//! cosine similarity over all stored vectors, sorted by score descending
//! with ties broken by id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::{IndexedDocument, VectorMatch, VectorRecord};

use super::VectorStore;

/// In-process vector index for local development and tests.
pub struct InMemoryVectorStore {
    embedder: Arc<dyn EmbeddingProvider>,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a stored document by id.
    pub fn get(&self, id: &str) -> Option<IndexedDocument> {
        let records = self.records.read().expect("vector store lock poisoned");
        records
            .get(id)
            .map(|r| IndexedDocument::new(r.id.clone(), r.text.clone(), r.metadata.clone()))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let mut stored = self.records.write().expect("vector store lock poisoned");
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id.clone());
            stored.insert(record.id.clone(), record);
        }
        Ok(ids)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>> {
        let stored = self.records.read().expect("vector store lock poisoned");
        let mut matches: Vec<VectorMatch> = stored
            .values()
            .map(|r| VectorMatch {
                document: IndexedDocument::new(r.id.clone(), r.text.clone(), r.metadata.clone()),
                score: cosine_similarity(vector, &r.vector),
                vector: r.vector.clone(),
            })
            .collect();
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
        Ok(self.records.read().expect("vector store lock poisoned").len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::hash::content_hash;
    use crate::models::Metadata;
    use crate::store::NativeSearch;

    fn store() -> InMemoryVectorStore {
        InMemoryVectorStore::new(Arc::new(HashingEmbedder::new("local-hash", 128)))
    }

    async fn add(store: &InMemoryVectorStore, texts: &[&str]) {
        let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let ids: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let metas = vec![Metadata::new(); texts.len()];
        store.add_texts(&texts, &metas, &ids).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_same_id_overwrites() {
        let s = store();
        add(&s, &["refund policy"]).await;
        add(&s, &["refund policy"]).await;
        assert_eq!(s.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_sorted_descending() {
        let s = store();
        add(&s, &["refund policy details", "shipping times", "refund window"]).await;
        let hits = s.similarity_search_with_score("refund", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(hits[0].document.text.contains("refund"));
    }

    #[tokio::test]
    async fn test_threshold_mode_filters() {
        let s = store();
        add(&s, &["refund policy", "kubernetes autoscaling"]).await;
        let docs = s
            .retrieve(
                "refund policy",
                5,
                NativeSearch::SimilarityScoreThreshold {
                    score_threshold: 0.99,
                },
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "refund policy");
    }

    #[tokio::test]
    async fn test_add_texts_rejects_mismatched_lengths() {
        let s = store();
        let err = s
            .add_texts(&["a".to_string()], &[], &["x".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("add_texts"));
    }
}
