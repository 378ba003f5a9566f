//! Event orchestration.
//!
//! The [`Orchestrator`] turns one [`InboundEvent`] into one run of the
//! external graph engine:
//!
//! 1. resolve an [`ExecutionContext`] through the [`Registry`];
//! 2. inside that request scope, retrieve grounding documents when the
//!    event asks for them;
//! 3. load the session's chat history and the thread's latest checkpoint;
//! 4. call [`GraphEngine::run`];
//! 5. append the user input and reply to history, then persist a
//!    checkpoint when the project has a saver. A failed history write
//!    leaves the thread's checkpoint where it was.
//!
//! Incremental output goes to an optional `mpsc` sink as [`OutputChunk`]s.
//! A dropped receiver never fails the event.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use grox_core::retrieval::SearchOptions;
use grox_core::{IndexedDocument, Metadata};

use crate::backends::checkpoint::key_segment;
use crate::backends::history::{ChatMessage, Role};
use crate::context::{self, ExecutionContext};
use crate::models::ChatModel;
use crate::registry::Registry;

/// One unit of work addressed to a tenant's project.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub tenant_id: String,
    pub project_code: String,
    pub session_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub input: Metadata,
    #[serde(default)]
    pub retrieval: Option<RetrievalRequest>,
}

/// Grounding query run before the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRequest {
    pub collection: String,
    pub query: String,
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default)]
    pub params: Metadata,
}

pub(crate) fn default_search_type() -> String {
    "similarity".to_string()
}
pub(crate) fn default_num_results() -> usize {
    5
}
pub(crate) fn default_score_threshold() -> f32 {
    0.8
}

impl RetrievalRequest {
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            num_results: self.num_results,
            score_threshold: self.score_threshold,
            params: self.params.clone(),
        }
    }
}

/// Incremental output of one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputChunk {
    Grounding { documents: Vec<IndexedDocument> },
    Text { content: String },
    Done { thread_id: String },
}

/// Handle the engine and the orchestrator write chunks through.
#[derive(Debug, Clone, Default)]
pub struct ChunkSink(Option<mpsc::Sender<OutputChunk>>);

impl ChunkSink {
    pub fn new(sender: Option<mpsc::Sender<OutputChunk>>) -> Self {
        Self(sender)
    }

    pub async fn send(&self, chunk: OutputChunk) {
        if let Some(tx) = &self.0 {
            if tx.send(chunk).await.is_err() {
                tracing::debug!("output_receiver_dropped");
            }
        }
    }
}

/// Everything the engine sees for one run.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub thread_id: String,
    pub session_id: String,
    pub input: Metadata,
    pub history: Vec<ChatMessage>,
    pub grounding: Vec<IndexedDocument>,
    /// State of the thread's latest checkpoint.
    pub previous_state: Option<Value>,
    pub chat_model: Option<ChatModel>,
    pub sink: ChunkSink,
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub reply: String,
    /// Persisted as the thread's next checkpoint.
    pub state: Value,
}

/// The external graph engine driving one unit of work.
#[async_trait]
pub trait GraphEngine: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext, request: EngineRequest) -> Result<EngineOutput>;
}

/// Echoes the user message, listing grounding snippets when present.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEngine;

#[async_trait]
impl GraphEngine for PassthroughEngine {
    async fn run(&self, _ctx: &ExecutionContext, request: EngineRequest) -> Result<EngineOutput> {
        let mut reply = user_message(&request.input);
        if !request.grounding.is_empty() {
            reply.push_str("\n\nContext:");
            for doc in &request.grounding {
                reply.push_str("\n- ");
                reply.push_str(&doc.text);
            }
        }
        request
            .sink
            .send(OutputChunk::Text {
                content: reply.clone(),
            })
            .await;

        let turns = request
            .previous_state
            .as_ref()
            .and_then(|s| s.get("turns"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let state = serde_json::json!({
            "turns": turns + 1,
            "last_input": Value::Object(request.input),
        });
        Ok(EngineOutput { reply, state })
    }
}

/// Result of [`Orchestrator::handle_event`].
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub thread_id: String,
    pub request_id: String,
    pub correlation_id: Option<String>,
    pub reply: String,
    pub grounding: Vec<IndexedDocument>,
    pub checkpoint_id: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    engine: Arc<dyn GraphEngine>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, engine: Arc<dyn GraphEngine>) -> Self {
        Self { registry, engine }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn handle_event(
        &self,
        event: InboundEvent,
        sink: Option<mpsc::Sender<OutputChunk>>,
    ) -> Result<EventOutcome> {
        if event.session_id.trim().is_empty() {
            bail!("session_id must not be empty");
        }
        let ctx = self.registry.create_execution_context(
            &event.tenant_id,
            &event.project_code,
            event.input.clone(),
            event.correlation_id.clone(),
            event.user_id.clone(),
        )?;
        context::scope(ctx.clone(), self.drive(ctx, event, ChunkSink::new(sink))).await
    }

    async fn drive(
        &self,
        ctx: ExecutionContext,
        event: InboundEvent,
        sink: ChunkSink,
    ) -> Result<EventOutcome> {
        let project = ctx.project();
        let thread_id = thread_id(
            project.tenant_id(),
            project.project_code(),
            &event.session_id,
        );
        tracing::info!(thread_id = %thread_id, "event_received");

        let grounding = match &event.retrieval {
            Some(req) => {
                let retrieval = project
                    .require_documents(&req.collection)?
                    .as_retrieval(&req.collection)?;
                retrieval
                    .similarity_search(&req.query, &req.search_type, &req.options())
                    .await?
            }
            None => Vec::new(),
        };
        if !grounding.is_empty() {
            sink.send(OutputChunk::Grounding {
                documents: grounding.clone(),
            })
            .await;
        }

        let history = project.history().for_session(&event.session_id);
        let messages = history.messages().await?;
        let previous_state = match project.checkpoint_saver() {
            Some(saver) => saver.latest(&thread_id).await?.map(|c| c.state),
            None => None,
        };

        let request = EngineRequest {
            thread_id: thread_id.clone(),
            session_id: event.session_id.clone(),
            input: ctx.input().clone(),
            history: messages,
            grounding: grounding.clone(),
            previous_state,
            chat_model: project.models().default_chat().cloned(),
            sink: sink.clone(),
        };
        let output = self.engine.run(&ctx, request).await?;

        history
            .add_message(ChatMessage::new(Role::User, user_message(ctx.input())))
            .await?;
        history
            .add_message(ChatMessage::new(Role::Assistant, output.reply.clone()))
            .await?;

        let checkpoint_id = match project.checkpoint_saver() {
            Some(saver) => Some(saver.put(&thread_id, output.state).await?.id),
            None => None,
        };

        sink.send(OutputChunk::Done {
            thread_id: thread_id.clone(),
        })
        .await;
        tracing::info!(
            thread_id = %thread_id,
            grounding = grounding.len(),
            checkpointed = checkpoint_id.is_some(),
            "event_completed"
        );

        Ok(EventOutcome {
            thread_id,
            request_id: ctx.request_id().to_string(),
            correlation_id: ctx.correlation_id().map(str::to_string),
            reply: output.reply,
            grounding,
            checkpoint_id,
        })
    }
}

/// The `message` field of the input when it is a string, otherwise the
/// whole input as JSON.
/// `tenant:project:session`, each part escaped with [`key_segment`].
pub fn thread_id(tenant_id: &str, project_code: &str, session_id: &str) -> String {
    format!(
        "{}:{}:{}",
        key_segment(tenant_id),
        key_segment(project_code),
        key_segment(session_id)
    )
}

fn user_message(input: &Metadata) -> String {
    match input.get("message") {
        Some(Value::String(s)) => s.clone(),
        _ => Value::Object(input.clone()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_request_defaults() {
        let req: RetrievalRequest =
            serde_json::from_str(r#"{"collection":"faq","query":"refund"}"#).unwrap();
        assert_eq!(req.search_type, "similarity");
        assert_eq!(req.num_results, 5);
        assert!((req.score_threshold - 0.8).abs() < 1e-6);
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_thread_id_keeps_parts_apart() {
        assert_eq!(thread_id("acme", "support", "s-1"), "acme:support:s-1");
        assert_ne!(thread_id("acme:x", "y", "s"), thread_id("acme", "x:y", "s"));
        assert_ne!(thread_id("acme", "x", "y:s"), thread_id("acme", "x:y", "s"));
    }

    #[test]
    fn test_user_message_prefers_message_field() {
        let mut input = Metadata::new();
        input.insert("message".into(), Value::from("hello"));
        assert_eq!(user_message(&input), "hello");

        let mut other = Metadata::new();
        other.insert("n".into(), Value::from(1));
        assert_eq!(user_message(&other), r#"{"n":1}"#);
    }

    #[test]
    fn test_output_chunk_tagging() {
        let chunk = OutputChunk::Text {
            content: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            serde_json::json!({"type": "text", "content": "hi"})
        );
    }

    #[tokio::test]
    async fn test_closed_sink_is_ignored() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        ChunkSink::new(Some(tx))
            .send(OutputChunk::Done {
                thread_id: "t".into(),
            })
            .await;
    }
}
