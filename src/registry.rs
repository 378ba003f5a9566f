//! Project registry.
//!
//! The [`Registry`] maps `(tenant_id, project_code)` to a built [`Project`]
//! and turns inbound identifiers into an [`ExecutionContext`]. One registry
//! is created by the process entry point and shared as `Arc<Registry>`;
//! nothing here is a global.
//!
//! Map mutations and lookups share one mutex. Nothing under the lock awaits
//! or does I/O, so lookups stay cheap while projects are built elsewhere.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use grox_core::{GroxError, Metadata};

use crate::backends::BackendFactory;
use crate::config::AppConfig;
use crate::context::{self, ExecutionContext};
use crate::logging::init_logging;
use crate::project::{Project, ProjectKey};

pub struct Registry {
    config: AppConfig,
    backends: Arc<BackendFactory>,
    projects: Mutex<HashMap<ProjectKey, Arc<Project>>>,
}

/// Outcome of [`Registry::register_all_projects`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub registered: Vec<ProjectKey>,
    pub failed: Vec<StartupFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupFailure {
    pub tenant_id: String,
    pub path: PathBuf,
    pub error: String,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Registry {
    /// Create a registry. Installs the global log subscriber on first use
    /// in the process; later registries reuse it.
    pub fn new(config: AppConfig) -> Self {
        Self::with_backends(config, Arc::new(BackendFactory::new()))
    }

    pub fn with_backends(config: AppConfig, backends: Arc<BackendFactory>) -> Self {
        init_logging(&config);
        Self {
            config,
            backends,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn backends(&self) -> &Arc<BackendFactory> {
        &self.backends
    }

    /// Load and register every project listed under `tenants`.
    ///
    /// Each project is independent: a failure is logged and recorded in the
    /// report, and the remaining projects are still registered.
    pub async fn register_all_projects(&self) -> StartupReport {
        let mut report = StartupReport::default();
        for (tenant_id, paths) in &self.config.tenants {
            for path in paths {
                match self.load_project(tenant_id, path).await {
                    Ok(project) => report.registered.push(project.key().clone()),
                    Err(e) => {
                        let error = format!("{:#}", e);
                        tracing::error!(
                            tenant_id = %tenant_id,
                            path = %path.display(),
                            error = %error,
                            "project_registration_failed"
                        );
                        report.failed.push(StartupFailure {
                            tenant_id: tenant_id.clone(),
                            path: path.clone(),
                            error,
                        });
                    }
                }
            }
        }
        tracing::info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "startup_complete"
        );
        report
    }

    /// Build the project at `path` for `tenant_id` and register it.
    pub async fn load_project(&self, tenant_id: &str, path: &std::path::Path) -> Result<Arc<Project>> {
        let project = Project::load(
            tenant_id,
            path,
            &self.backends,
            self.config.indexing.concurrency,
        )
        .await?;
        let project = Arc::new(project);
        self.register_project(Arc::clone(&project));
        Ok(project)
    }

    /// Insert `project`, replacing any project under the same key.
    /// Returns the replaced project.
    pub fn register_project(&self, project: Arc<Project>) -> Option<Arc<Project>> {
        let key = project.key().clone();
        let previous = self
            .projects
            .lock()
            .expect("registry lock poisoned")
            .insert(key.clone(), project);
        tracing::info!(
            tenant_id = %key.tenant_id,
            project_code = %key.project_code,
            replaced = previous.is_some(),
            "project_registered"
        );
        previous
    }

    pub fn unregister_project(&self, tenant_id: &str, project_code: &str) -> Option<Arc<Project>> {
        let key = ProjectKey::new(tenant_id, project_code);
        let removed = self
            .projects
            .lock()
            .expect("registry lock poisoned")
            .remove(&key);
        if removed.is_some() {
            tracing::info!(tenant_id, project_code, "project_unregistered");
        }
        removed
    }

    pub fn get_project(&self, tenant_id: &str, project_code: &str) -> Option<Arc<Project>> {
        let key = ProjectKey::new(tenant_id, project_code);
        self.projects
            .lock()
            .expect("registry lock poisoned")
            .get(&key)
            .cloned()
    }

    /// Like [`get_project`](Self::get_project), failing with
    /// `ProjectNotFound` when absent.
    pub fn require_project(&self, tenant_id: &str, project_code: &str) -> Result<Arc<Project>, GroxError> {
        self.get_project(tenant_id, project_code)
            .ok_or_else(|| GroxError::project_not_found(tenant_id, project_code))
    }

    /// Snapshot of registered keys, sorted.
    pub fn list_projects(&self) -> Vec<ProjectKey> {
        let mut keys: Vec<ProjectKey> = self
            .projects
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.projects.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the project and build a fresh context for one request.
    ///
    /// Fails with `ProjectNotFound` when the key is unregistered; the
    /// registry is not modified either way.
    pub fn create_execution_context(
        &self,
        tenant_id: &str,
        project_code: &str,
        input: Metadata,
        correlation_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<ExecutionContext, GroxError> {
        let project = self.require_project(tenant_id, project_code)?;
        Ok(ExecutionContext::new(project, input, correlation_id, user_id))
    }

    /// Create a context and run `f` with it as the current context.
    pub async fn run_in_context<F, Fut, T>(
        &self,
        tenant_id: &str,
        project_code: &str,
        input: Metadata,
        correlation_id: Option<String>,
        user_id: Option<String>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx =
            self.create_execution_context(tenant_id, project_code, input, correlation_id, user_id)?;
        context::scope(ctx.clone(), f(ctx)).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("service", &self.config.service)
            .field("projects", &self.list_projects())
            .finish()
    }
}
