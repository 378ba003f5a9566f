//! JSON HTTP API.
//!
//! # Endpoints
//!
//! - `GET /health`: liveness plus crate version
//! - `GET /projects`: summaries of registered projects
//! - `POST /events`: run one [`InboundEvent`] through the orchestrator
//! - `POST /search`: query one document collection
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "project not found: acme/sales" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use grox_core::error::classify;
use grox_core::retrieval::SearchOptions;
use grox_core::{GroxError, IndexedDocument, Metadata};

use crate::orchestrator::{
    default_num_results, default_score_threshold, default_search_type, EventOutcome,
    InboundEvent, Orchestrator,
};
use crate::project::ProjectSummary;
use crate::registry::Registry;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the router without binding a socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/projects", get(handle_projects))
        .route("/events", post(handle_event))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(state)
}

/// Serve on `server.bind` until the process is terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.registry.config().server.bind.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "server_listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// `bad_request`, `not_found` or `internal`.
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<GroxError> for AppError {
    fn from(err: GroxError) -> Self {
        let message = err.to_string();
        if err.is_not_found() {
            not_found(message)
        } else if err.is_invalid_value() || matches!(err, GroxError::ConfigValidation(_)) {
            bad_request(message)
        } else {
            internal(message)
        }
    }
}

/// Map by the first [`GroxError`] in the chain; anything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match classify(&err) {
            Some(grox) => {
                let mut app: AppError = grox.clone().into();
                app.message = format!("{:#}", err);
                app
            }
            None => {
                let message = format!("{:#}", err);
                tracing::error!(error = %message, "request_failed");
                internal(message)
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /projects ============

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<ProjectSummary>,
}

async fn handle_projects(State(state): State<AppState>) -> Json<ProjectsResponse> {
    let projects = state
        .registry
        .list_projects()
        .into_iter()
        .filter_map(|key| state.registry.get_project(&key.tenant_id, &key.project_code))
        .map(|p| p.summary())
        .collect();
    Json(ProjectsResponse { projects })
}

// ============ POST /events ============

async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventOutcome>, AppError> {
    if event.session_id.trim().is_empty() {
        return Err(bad_request("session_id must not be empty"));
    }
    let outcome = state.orchestrator.handle_event(event, None).await?;
    Ok(Json(outcome))
}

// ============ POST /search ============

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub tenant_id: String,
    pub project_code: String,
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

#[derive(Serialize)]
struct SearchResponse {
    collection: String,
    search_type: String,
    results: Vec<IndexedDocument>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let project = state
        .registry
        .require_project(&req.tenant_id, &req.project_code)?;
    let retrieval = project
        .require_documents(&req.collection)?
        .as_retrieval(&req.collection)?;
    let options = SearchOptions {
        num_results: req.num_results,
        score_threshold: req.score_threshold,
        params: req.params,
    };
    let results = retrieval
        .similarity_search(&req.query, &req.search_type, &options)
        .await?;

    Ok(Json(SearchResponse {
        collection: req.collection,
        search_type: req.search_type,
        results,
    }))
}
