//! # grox
//!
//! A multi-tenant request-execution substrate for agent-style workloads.
//!
//! Each tenant deploys one or more projects. A project config names its
//! models, its checkpoint / chat-history / vector backends, and its document
//! collections. The [`registry::Registry`] builds every project at startup
//! and hands out one [`context::ExecutionContext`] per inbound event; the
//! [`orchestrator::Orchestrator`] runs the event through an external graph
//! engine, grounded on the project's documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌──────────────────┐
//! │ App config │──▶│ Registry │──▶│ Project          │
//! │ + projects │   │          │   │ models, backends │
//! └────────────┘   └────┬─────┘   │ document store   │
//!                       │         └────────┬─────────┘
//!                       ▼                  ▼
//!                ┌──────────────┐   ┌─────────────┐
//!                │ Orchestrator │──▶│  Retrieval  │
//!                │ (CLI / HTTP) │   │ vector+BM25 │
//!                └──────────────┘   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | App and project config documents |
//! | [`logging`] | JSON logging and the log callback |
//! | [`backends`] | Backend factory: checkpoints, chat history, vector stores |
//! | [`documents`] | Document collections and the per-project document store |
//! | [`embedding`] | Embedding providers |
//! | [`models`] | Model handle table |
//! | [`project`] | Project construction |
//! | [`registry`] | Project registry and context creation |
//! | [`context`] | Execution context and request scope |
//! | [`orchestrator`] | Event handling over the graph engine |
//! | [`server`] | HTTP API |
//!
//! Retrieval, BM25, hashing, TTL parsing and the error taxonomy live in
//! the `grox_core` crate.

pub mod backends;
pub mod config;
pub mod context;
pub mod documents;
pub mod embedding;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod project;
pub mod registry;
pub mod server;
