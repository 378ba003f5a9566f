//! Embeddings: the provider seam, a local hashing model, and the vector
//! helpers shared by every vector store.
//!
//! [`HashingEmbedder`] needs no network and is stable across runs, which
//! makes it the `local` provider and the model used in tests.
//!
//! Network-backed providers (OpenAI) live in the `grox` app crate.

use anyhow::Result;
use async_trait::async_trait;

/// Turns text into fixed-size vectors.
///
/// Implementations are created from a project's model table and shared
/// read-only across all requests for that project.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Length of every vector this provider returns.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Defaults to a one-element batch.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_documents(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("provider {} returned no vector", self.model_name()))
    }
}

/// Deterministic bag-of-words embedder using feature hashing.
///
/// Each lowercase alphanumeric token is hashed (FNV-1a) into one of `dims`
/// buckets with a sign bit, and the result is L2-normalized. Identical
/// texts always map to identical vectors and texts sharing vocabulary get
/// positive cosine similarity, which is all the local backends need.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model: String,
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in crate::bm25::tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use grox_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let stored = vec_to_blob(&[0.5f32, -1.0]);
/// assert_eq!(stored.len(), 8);
/// assert_eq!(blob_to_vec(&stored), vec![0.5, -1.0]);
/// ```
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]; a trailing partial value is ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .filter_map(|b| b.try_into().ok().map(f32::from_le_bytes))
        .collect()
}

/// Cosine of the angle between `a` and `b`.
///
/// Mismatched lengths, empty input and zero vectors all score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let norm = (aa * bb).sqrt();
    if norm < f32::EPSILON {
        0.0
    } else {
        dot / norm
    }
}
