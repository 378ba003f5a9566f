//! # grox CLI
//!
//! Loads an app config, registers every configured project, and runs one
//! command against them.
//!
//! ## Usage
//!
//! ```bash
//! grox --config ./grox.yaml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `grox projects` | List registered projects |
//! | `grox index <tenant> <project> [collection]` | Index document collections |
//! | `grox search <tenant> <project> <collection> "<query>"` | Query a collection |
//! | `grox run <tenant> <project> --session <id>` | Run one event through the orchestrator |
//! | `grox serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # BM25 re-ranked search over the faq collection
//! grox search acme support faq "refund window" --mode similarity_search_with_score_bm25_ranked
//!
//! # One conversational turn
//! grox run acme support --session s-1 --input message="where is my parcel?"
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use grox::config::load_app_config;
use grox::orchestrator::{InboundEvent, Orchestrator, OutputChunk, PassthroughEngine, RetrievalRequest};
use grox::registry::Registry;
use grox::server::{run_server, AppState};
use grox_core::retrieval::SearchOptions;
use grox_core::Metadata;

/// grox: multi-tenant project registry with document retrieval and
/// request-scoped orchestration.
#[derive(Parser)]
#[command(name = "grox", version)]
struct Cli {
    /// Path to the app config (YAML, TOML or JSON).
    #[arg(long, global = true, default_value = "./grox.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered projects with their models, backends and collections.
    Projects,

    /// Index document collections of one project.
    ///
    /// Indexes every collection unless one is named. Indexing is idempotent:
    /// snippets are keyed by content hash.
    Index {
        tenant: String,
        project: String,
        collection: Option<String>,
    },

    /// Query one document collection.
    Search {
        tenant: String,
        project: String,
        collection: String,
        query: String,

        /// Search type: `similarity`, `mmr`, `similarity_score_threshold`,
        /// `similarity_search_with_score` or
        /// `similarity_search_with_score_bm25_ranked`.
        #[arg(long, default_value = "similarity")]
        mode: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Minimum similarity score for the threshold-based modes.
        #[arg(long, default_value_t = 0.8)]
        threshold: f32,
    },

    /// Run one event through the orchestrator and stream its output.
    Run {
        tenant: String,
        project: String,

        /// Session id; the thread id is `<tenant>:<project>:<session>`.
        #[arg(long)]
        session: String,

        /// Input field as KEY=VALUE; repeatable.
        #[arg(long = "input", value_parser = parse_key_val)]
        input: Vec<(String, String)>,

        /// Collection to ground the run on; the query is the `message` input.
        #[arg(long)]
        collection: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,

        #[arg(long)]
        user_id: Option<String>,
    },

    /// Start the HTTP server on `server.bind`.
    Serve,
}

/// Parse a `KEY=VALUE` string into a tuple.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_app_config(&cli.config)?;

    let registry = Arc::new(Registry::new(cfg));
    let report = registry.register_all_projects().await;
    for failure in &report.failed {
        eprintln!(
            "warning: project {} for tenant {} not registered: {}",
            failure.path.display(),
            failure.tenant_id,
            failure.error
        );
    }

    match cli.command {
        Commands::Projects => {
            let keys = registry.list_projects();
            if keys.is_empty() {
                println!("No projects registered.");
            }
            for key in keys {
                if let Some(project) = registry.get_project(&key.tenant_id, &key.project_code) {
                    println!("{}", serde_json::to_string_pretty(&project.summary())?);
                }
            }
        }
        Commands::Index {
            tenant,
            project,
            collection,
        } => {
            let project = registry.require_project(&tenant, &project)?;
            let store = project.documents().ok_or_else(|| {
                anyhow::anyhow!("project {} has no document collections", project.key())
            })?;
            let names: Vec<String> = match collection {
                Some(name) => vec![name],
                None => store
                    .list_collections()
                    .iter()
                    .map(|c| c.name.clone())
                    .collect(),
            };
            for name in names {
                let count = store.index_documents(&name).await?;
                println!("{}: indexed {} snippets", name, count);
            }
        }
        Commands::Search {
            tenant,
            project,
            collection,
            query,
            mode,
            limit,
            threshold,
        } => {
            let project = registry.require_project(&tenant, &project)?;
            project.wait_until_indexed().await?;
            let retrieval = project
                .require_documents(&collection)?
                .as_retrieval(&collection)?;
            let options = SearchOptions {
                num_results: limit,
                score_threshold: threshold,
                params: Metadata::new(),
            };
            let results = retrieval.similarity_search(&query, &mode, &options).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, doc) in results.iter().enumerate() {
                println!("{}. [{}] {}", i + 1, &doc.id[..doc.id.len().min(12)], doc.text);
            }
        }
        Commands::Run {
            tenant,
            project,
            session,
            input,
            collection,
            correlation_id,
            user_id,
        } => {
            if let Some(p) = registry.get_project(&tenant, &project) {
                p.wait_until_indexed().await?;
            }
            let input: Metadata = input
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let retrieval = collection.map(|collection| RetrievalRequest {
                collection,
                query: input
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                search_type: "similarity".to_string(),
                num_results: 5,
                score_threshold: 0.8,
                params: Metadata::new(),
            });
            let event = InboundEvent {
                tenant_id: tenant,
                project_code: project,
                session_id: session,
                correlation_id,
                user_id,
                input,
                retrieval,
            };

            let orchestrator = Orchestrator::new(registry.clone(), Arc::new(PassthroughEngine));
            let (tx, mut rx) = mpsc::channel(16);
            let printer = tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    match chunk {
                        OutputChunk::Grounding { documents } => {
                            println!("[grounding: {} documents]", documents.len())
                        }
                        OutputChunk::Text { content } => println!("{}", content),
                        OutputChunk::Done { thread_id } => println!("[done: {}]", thread_id),
                    }
                }
            });
            let outcome = orchestrator.handle_event(event, Some(tx)).await;
            printer.await?;
            let outcome = outcome?;
            if let Some(id) = outcome.checkpoint_id {
                println!("checkpoint: {}", id);
            }
        }
        Commands::Serve => {
            let orchestrator = Arc::new(Orchestrator::new(
                registry.clone(),
                Arc::new(PassthroughEngine),
            ));
            run_server(AppState {
                registry,
                orchestrator,
            })
            .await?;
        }
    }

    Ok(())
}
