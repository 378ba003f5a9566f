//! Vector index abstraction for grox.
//!
//! The [`VectorStore`] trait defines the three primitive operations every
//! backend implements (`upsert`, `query`, `count`). Text-level operations
//! (`add_texts`, `similarity_search_with_score`) and the native retrieval
//! modes (similarity, MMR, score threshold) are provided on top of them, so
//! a backend only has to know how to store and scan vectors.
//!
//! Implementations must be `Send + Sync`; one instance is shared by every
//! request that touches its collection.

pub mod memory;

use std::sync::Arc;

use anyhow::{ensure, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::{IndexedDocument, Metadata, ScoredDocument, VectorMatch, VectorRecord};

/// Default candidate pool for MMR when the caller does not pass `fetch_k`.
pub const DEFAULT_MMR_FETCH_K: usize = 20;
/// Default diversity trade-off for MMR (1.0 = pure relevance).
pub const DEFAULT_MMR_LAMBDA: f32 = 0.5;

/// Retrieval modes the vector engine serves natively.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeSearch {
    /// Top-k by similarity.
    Similarity,
    /// Maximal marginal relevance over `fetch_k` candidates.
    Mmr { fetch_k: usize, lambda_mult: f32 },
    /// Top-k, then drop anything scoring below the threshold.
    SimilarityScoreThreshold { score_threshold: f32 },
}

/// Abstract vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite records by id |
/// | [`query`](VectorStore::query) | Nearest neighbours of a query vector |
/// | [`count`](VectorStore::count) | Number of stored records |
/// | [`add_texts`](VectorStore::add_texts) | Embed and upsert texts |
/// | [`similarity_search_with_score`](VectorStore::similarity_search_with_score) | Scored text search |
/// | [`retrieve`](VectorStore::retrieve) | Native retrieval modes |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The embedding model used for both documents and queries.
    fn embedder(&self) -> &Arc<dyn EmbeddingProvider>;

    /// Insert or overwrite records keyed by `id`. Returns the ids written.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<Vec<String>>;

    /// Return up to `k` nearest records to `vector` with cosine scores.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>>;

    /// Number of records currently stored.
    async fn count(&self) -> Result<usize>;

    /// Whether [`query`](VectorStore::query) results are guaranteed to be in
    /// descending score order.
    fn returns_sorted(&self) -> bool {
        true
    }

    /// Embed `texts` and upsert them under `ids` with matching `metadatas`.
    async fn add_texts(
        &self,
        texts: &[String],
        metadatas: &[Metadata],
        ids: &[String],
    ) -> Result<Vec<String>> {
        ensure!(
            texts.len() == metadatas.len() && texts.len() == ids.len(),
            "add_texts: {} texts, {} metadatas, {} ids",
            texts.len(),
            metadatas.len(),
            ids.len()
        );
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embedder().embed_documents(texts).await?;
        ensure!(
            vectors.len() == texts.len(),
            "embedding model returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        );

        let records = texts
            .iter()
            .zip(metadatas)
            .zip(ids)
            .zip(vectors)
            .map(|(((text, metadata), id), vector)| VectorRecord {
                id: id.clone(),
                text: text.clone(),
                metadata: metadata.clone(),
                vector,
            })
            .collect();
        self.upsert(records).await
    }

    /// Embed `query` and return up to `k` scored documents.
    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let query_vec = self.embedder().embed_query(query).await?;
        let matches = self.query(&query_vec, k).await?;
        Ok(matches.into_iter().map(ScoredDocument::from).collect())
    }

    /// Serve one of the native retrieval modes.
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        mode: NativeSearch,
    ) -> Result<Vec<IndexedDocument>> {
        let query_vec = self.embedder().embed_query(query).await?;
        match mode {
            NativeSearch::Similarity => {
                let matches = sorted(self.query(&query_vec, k).await?);
                Ok(matches.into_iter().map(|m| m.document).collect())
            }
            NativeSearch::SimilarityScoreThreshold { score_threshold } => {
                let matches = sorted(self.query(&query_vec, k).await?);
                Ok(matches
                    .into_iter()
                    .filter(|m| m.score >= score_threshold)
                    .map(|m| m.document)
                    .collect())
            }
            NativeSearch::Mmr {
                fetch_k,
                lambda_mult,
            } => {
                let candidates = self.query(&query_vec, fetch_k.max(k)).await?;
                let vectors: Vec<&[f32]> = candidates.iter().map(|m| m.vector.as_slice()).collect();
                let picked = maximal_marginal_relevance(&query_vec, &vectors, lambda_mult, k);
                Ok(picked
                    .into_iter()
                    .map(|i| candidates[i].document.clone())
                    .collect())
            }
        }
    }
}

fn sorted(mut matches: Vec<VectorMatch>) -> Vec<VectorMatch> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches
}

/// Select `k` candidate indices balancing query relevance against
/// redundancy with already-selected candidates.
///
/// `lambda_mult = 1.0` degenerates to plain similarity ordering;
/// `0.0` maximizes diversity.
pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[&[f32]],
    lambda_mult: f32,
    k: usize,
) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c))
        .collect();

    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));
    while selected.len() < k.min(candidates.len()) {
        let mut best: Option<(usize, f32)> = None;
        for (i, cand) in candidates.iter().enumerate() {
            if selected.contains(&i) {
                continue;
            }
            let redundancy = selected
                .iter()
                .map(|&j| cosine_similarity(cand, candidates[j]))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
            let score = lambda_mult * relevance[i] - (1.0 - lambda_mult) * redundancy;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        match best {
            Some((i, _)) => selected.push(i),
            None => break,
        }
    }
    selected
}
