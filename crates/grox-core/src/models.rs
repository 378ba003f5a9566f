//! Data types that flow between the document store, vector stores, and
//! the retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Free-form metadata attached to a document.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A text snippet as stored in a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Content hash of the text; the upsert key.
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl IndexedDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }
}

/// A document paired with its similarity score from the vector engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    pub document: IndexedDocument,
    pub score: f32,
}

/// A record ready for upsert: text, metadata, key, and embedding.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

/// A query hit including the stored vector (needed for MMR).
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub document: IndexedDocument,
    pub score: f32,
    pub vector: Vec<f32>,
}

impl From<VectorMatch> for ScoredDocument {
    fn from(m: VectorMatch) -> Self {
        ScoredDocument {
            document: m.document,
            score: m.score,
        }
    }
}
