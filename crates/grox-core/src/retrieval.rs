//! Query-time retrieval over one vector index.
//!
//! [`DocumentRetrieval`] dispatches on a [`SearchType`]:
//!
//! | Search type | Behaviour |
//! |-------------|-----------|
//! | `similarity` | Native top-k |
//! | `mmr` | Native maximal marginal relevance |
//! | `similarity_score_threshold` | Native top-k, drop scores below threshold |
//! | `similarity_search_with_score` | Scored top-k, then [`top_k_by_threshold`] |
//! | `similarity_search_with_score_bm25_ranked` | The above, then BM25 re-rank of the survivors |
//!
//! The BM25 stage only ever scores the small vector-prefiltered candidate
//! pool, never the collection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::bm25::{Bm25Index, Bm25Params};
use crate::error::GroxError;
use crate::models::{IndexedDocument, Metadata, ScoredDocument};
use crate::store::{NativeSearch, VectorStore, DEFAULT_MMR_FETCH_K, DEFAULT_MMR_LAMBDA};

/// Supported retrieval modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Similarity,
    Mmr,
    SimilarityScoreThreshold,
    #[serde(rename = "similarity_search_with_score")]
    SimilarityWithScore,
    #[serde(rename = "similarity_search_with_score_bm25_ranked")]
    SimilarityWithScoreBm25Ranked,
}

impl SearchType {
    pub const ALL: [SearchType; 5] = [
        SearchType::Similarity,
        SearchType::Mmr,
        SearchType::SimilarityScoreThreshold,
        SearchType::SimilarityWithScore,
        SearchType::SimilarityWithScoreBm25Ranked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Similarity => "similarity",
            SearchType::Mmr => "mmr",
            SearchType::SimilarityScoreThreshold => "similarity_score_threshold",
            SearchType::SimilarityWithScore => "similarity_search_with_score",
            SearchType::SimilarityWithScoreBm25Ranked => {
                "similarity_search_with_score_bm25_ranked"
            }
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = GroxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SearchType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| GroxError::UnsupportedSearchType(s.to_string()))
    }
}

/// Per-call retrieval parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum number of documents returned.
    pub num_results: usize,
    /// Minimum similarity score for the threshold-based modes.
    pub score_threshold: f32,
    /// Mode-specific extras: `k1`, `b`, `epsilon` for BM25; `fetch_k`,
    /// `lambda_mult` for MMR.
    pub params: Metadata,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            num_results: 5,
            score_threshold: 0.8,
            params: Metadata::new(),
        }
    }
}

impl SearchOptions {
    fn param_f64(&self, key: &str) -> Option<f64> {
        match self.params.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// BM25 parameters from `params`, falling back to the defaults.
    pub fn bm25_params(&self) -> Bm25Params {
        let defaults = Bm25Params::default();
        Bm25Params {
            k1: self.param_f64("k1").unwrap_or(defaults.k1),
            b: self.param_f64("b").unwrap_or(defaults.b),
            epsilon: self.param_f64("epsilon").unwrap_or(defaults.epsilon),
        }
    }

    fn native(&self, search_type: SearchType) -> NativeSearch {
        match search_type {
            SearchType::Mmr => NativeSearch::Mmr {
                fetch_k: self
                    .param_f64("fetch_k")
                    .map(|v| v.max(0.0) as usize)
                    .unwrap_or_else(|| DEFAULT_MMR_FETCH_K.max(self.num_results * 4)),
                lambda_mult: self
                    .param_f64("lambda_mult")
                    .map(|v| v as f32)
                    .unwrap_or(DEFAULT_MMR_LAMBDA),
            },
            SearchType::SimilarityScoreThreshold => NativeSearch::SimilarityScoreThreshold {
                score_threshold: self.score_threshold,
            },
            _ => NativeSearch::Similarity,
        }
    }
}

/// Lexical re-ranking stage applied to a candidate pool.
pub trait Reranker: Send + Sync {
    fn rerank(
        &self,
        query: &str,
        candidates: Vec<IndexedDocument>,
        k: usize,
        params: &Bm25Params,
    ) -> Vec<IndexedDocument>;
}

/// Okapi BM25 re-ranker.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bm25Reranker;

impl Reranker for Bm25Reranker {
    fn rerank(
        &self,
        query: &str,
        candidates: Vec<IndexedDocument>,
        k: usize,
        params: &Bm25Params,
    ) -> Vec<IndexedDocument> {
        let corpus: Vec<&str> = candidates.iter().map(|d| d.text.as_str()).collect();
        let order = Bm25Index::new(&corpus, *params).top_n(query, k);
        let mut slots: Vec<Option<IndexedDocument>> = candidates.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }
}

/// Keep results scoring at least `threshold`, then truncate to `k`.
///
/// Order is preserved as received; this stage does not sort.
pub fn top_k_by_threshold(
    results: Vec<ScoredDocument>,
    threshold: f32,
    k: usize,
) -> Vec<ScoredDocument> {
    results
        .into_iter()
        .filter(|r| r.score >= threshold)
        .take(k)
        .collect()
}

/// Stateless retrieval pipeline over one vector index.
#[derive(Clone)]
pub struct DocumentRetrieval {
    store: Arc<dyn VectorStore>,
    reranker: Arc<dyn Reranker>,
    collection: String,
}

impl std::fmt::Debug for DocumentRetrieval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRetrieval")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl DocumentRetrieval {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            reranker: Arc::new(Bm25Reranker),
            collection: collection.into(),
        }
    }

    /// Replace the lexical re-ranking stage.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Run `search_type` (by name) for `query`.
    ///
    /// Unknown names fail with [`GroxError::UnsupportedSearchType`].
    pub async fn similarity_search(
        &self,
        query: &str,
        search_type: &str,
        options: &SearchOptions,
    ) -> Result<Vec<IndexedDocument>> {
        let search_type: SearchType = search_type.parse()?;
        self.search(query, search_type, options).await
    }

    pub async fn search(
        &self,
        query: &str,
        search_type: SearchType,
        options: &SearchOptions,
    ) -> Result<Vec<IndexedDocument>> {
        match search_type {
            SearchType::Similarity | SearchType::Mmr | SearchType::SimilarityScoreThreshold => {
                let docs = self
                    .store
                    .retrieve(query, options.num_results, options.native(search_type))
                    .await?;
                tracing::info!(
                    collection = %self.collection,
                    search_type = %search_type,
                    results = docs.len(),
                    "native_search"
                );
                Ok(docs)
            }
            SearchType::SimilarityWithScore => {
                self.similarity_search_with_score(query, options).await
            }
            SearchType::SimilarityWithScoreBm25Ranked => {
                self.similarity_search_with_score_bm25_ranked(query, options)
                    .await
            }
        }
    }

    /// Scored vector search followed by threshold filtering.
    pub async fn similarity_search_with_score(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<IndexedDocument>> {
        let mut docs_with_scores = self
            .store
            .similarity_search_with_score(query, options.num_results)
            .await?;

        if !self.store.returns_sorted() {
            docs_with_scores.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let fetched = docs_with_scores.len();
        let filtered = top_k_by_threshold(
            docs_with_scores,
            options.score_threshold,
            options.num_results,
        );

        tracing::info!(
            collection = %self.collection,
            docs_with_scores = fetched,
            filtered = filtered.len(),
            score_threshold = options.score_threshold,
            "similarity_search_with_score"
        );
        Ok(filtered.into_iter().map(|r| r.document).collect())
    }

    /// Threshold-filtered vector search, then BM25 over the survivors.
    pub async fn similarity_search_with_score_bm25_ranked(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<IndexedDocument>> {
        let candidates = self.similarity_search_with_score(query, options).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let params = options.bm25_params();
        let candidate_count = candidates.len();
        let ranked = self
            .reranker
            .rerank(query, candidates, options.num_results, &params);

        tracing::info!(
            collection = %self.collection,
            candidate_docs = candidate_count,
            ranked = ranked.len(),
            k = options.num_results,
            k1 = params.k1,
            b = params.b,
            epsilon = params.epsilon,
            "similarity_search_with_score_bm25_ranked"
        );
        Ok(ranked)
    }
}
