//! Checkpoint persistence consumed by the graph engine.
//!
//! Checkpoints are opaque JSON states appended per thread. Every saver is
//! scoped to a namespace of the form `"{tenant}:{project}"`, so one physical
//! store can serve all projects without their threads colliding. Each part
//! is escaped by [`key_segment`], which keeps distinct pairs distinct even
//! when an id itself contains `:`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One persisted engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub thread_id: String,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, state: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            state,
            created_at: Utc::now(),
        }
    }
}

/// Checkpoint store for one tenant/project namespace.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    fn namespace(&self) -> &str;

    /// Append a new checkpoint for `thread_id`.
    async fn put(&self, thread_id: &str, state: Value) -> Result<Checkpoint>;

    /// Most recent live checkpoint for `thread_id`.
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All live checkpoints for `thread_id`, oldest first.
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Drop every checkpoint of `thread_id`; returns how many were removed.
    async fn delete_thread(&self, thread_id: &str) -> Result<usize>;
}

pub fn namespace(tenant_id: &str, project_code: &str) -> String {
    format!("{}:{}", key_segment(tenant_id), key_segment(project_code))
}

/// Percent-escape `%` and `:` so the part can be joined with `:`.
pub fn key_segment(part: &str) -> Cow<'_, str> {
    if part.contains(['%', ':']) {
        Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(part)
    }
}

type ThreadKey = (String, String);

/// Process-wide storage behind every [`InMemoryCheckpointSaver`].
#[derive(Default)]
pub struct MemoryCheckpointTable {
    threads: RwLock<HashMap<ThreadKey, Vec<Checkpoint>>>,
}

/// In-memory checkpoint saver. Nothing expires.
pub struct InMemoryCheckpointSaver {
    namespace: String,
    table: Arc<MemoryCheckpointTable>,
}

impl InMemoryCheckpointSaver {
    pub fn new(namespace: impl Into<String>, table: Arc<MemoryCheckpointTable>) -> Self {
        Self {
            namespace: namespace.into(),
            table,
        }
    }

    fn key(&self, thread_id: &str) -> ThreadKey {
        (self.namespace.clone(), thread_id.to_string())
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn put(&self, thread_id: &str, state: Value) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(thread_id, state);
        let mut threads = self.table.threads.write().expect("checkpoint lock poisoned");
        threads
            .entry(self.key(thread_id))
            .or_default()
            .push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.table.threads.read().expect("checkpoint lock poisoned");
        Ok(threads
            .get(&self.key(thread_id))
            .and_then(|cps| cps.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let threads = self.table.threads.read().expect("checkpoint lock poisoned");
        Ok(threads
            .get(&self.key(thread_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        let mut threads = self.table.threads.write().expect("checkpoint lock poisoned");
        Ok(threads
            .remove(&self.key(thread_id))
            .map(|cps| cps.len())
            .unwrap_or(0))
    }
}
