//! Per-request execution context.
//!
//! An [`ExecutionContext`] binds one registered [`Project`] to the
//! identifiers of one inbound event. It is immutable and cheap to clone.
//!
//! Code that has the context passes it explicitly. For code further down
//! the call chain, [`scope`] makes a context "current" for the duration of
//! a future: [`current`] returns it from anywhere inside that future, and
//! [`spawn`] carries it into tasks started on the request's behalf.
//! Concurrent scopes never see each other's context, and outside any scope
//! [`current`] returns `None`.

use std::future::Future;
use std::sync::Arc;

use grox_core::Metadata;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::project::Project;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

struct Inner {
    request_id: String,
    project: Arc<Project>,
    input: Metadata,
    correlation_id: Option<String>,
    user_id: Option<String>,
    span: Span,
}

impl ExecutionContext {
    pub fn new(
        project: Arc<Project>,
        input: Metadata,
        correlation_id: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            tenant_id = %project.tenant_id(),
            project_code = %project.project_code(),
            correlation_id = correlation_id.as_deref(),
            user_id = user_id.as_deref(),
        );
        Self {
            inner: Arc::new(Inner {
                request_id,
                project,
                input,
                correlation_id,
                user_id,
                span,
            }),
        }
    }

    /// Unique per context; two contexts built from the same event differ.
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.inner.project
    }

    pub fn input(&self) -> &Metadata {
        &self.inner.input
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.correlation_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    /// Span carrying the request identifiers; log events inside it are
    /// tagged with them.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ExecutionContext {}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("request_id", &self.inner.request_id)
            .field("project", self.inner.project.key())
            .field("correlation_id", &self.inner.correlation_id)
            .field("user_id", &self.inner.user_id)
            .finish()
    }
}

/// Run `fut` with `ctx` as the current context. Nested scopes override
/// the outer one until they end.
pub async fn scope<F: Future>(ctx: ExecutionContext, fut: F) -> F::Output {
    let span = ctx.span().clone();
    CURRENT.scope(ctx, fut.instrument(span)).await
}

/// The current context, or `None` outside any [`scope`].
pub fn current() -> Option<ExecutionContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// `tokio::spawn` that carries the current context into the new task.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(ctx) => {
            let span = ctx.span().clone();
            tokio::spawn(CURRENT.scope(ctx, fut.instrument(span)))
        }
        None => tokio::spawn(fut),
    }
}
