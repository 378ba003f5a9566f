//! # grox core
//!
//! Runtime-agnostic building blocks shared by the grox service: the error
//! taxonomy, TTL parsing, content hashing, the embedding trait, the
//! [`store::VectorStore`] abstraction with its in-memory index, BM25, and the
//! document retrieval pipeline.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Backends that need them live in the `grox` app crate and plug in through
//! the traits defined here.

pub mod bm25;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod ttl;

pub use error::GroxError;
pub use models::{IndexedDocument, Metadata, ScoredDocument};
