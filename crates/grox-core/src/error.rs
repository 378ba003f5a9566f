//! Error taxonomy for grox.
//!
//! Operations return `anyhow::Result`; the variants below are raised as
//! `anyhow::Error` values so callers can classify a failure with
//! `err.downcast_ref::<GroxError>()` without losing attached context.

use thiserror::Error;

/// Classified failures surfaced by the registry, backend factory, document
/// store, and retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroxError {
    /// No project is registered under the (tenant, project) key.
    #[error("project not found: {tenant_id}/{project_code}")]
    ProjectNotFound {
        tenant_id: String,
        project_code: String,
    },

    /// The document store has no collection with this name.
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    /// Malformed or internally inconsistent project configuration.
    #[error("invalid project configuration: {0}")]
    ConfigValidation(String),

    /// TTL string does not match `<N><s|m|h|d|w>`.
    #[error("invalid TTL format: '{0}'")]
    InvalidTtl(String),

    /// Backend kind outside the supported set.
    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    /// Search mode outside the supported set.
    #[error("unsupported search type: '{0}'")]
    UnsupportedSearchType(String),

    /// A live connection to an external store could not be established.
    #[error("backend connection to {target} failed: {reason}")]
    BackendConnection { target: String, reason: String },

    /// The same collection name appears in two document files.
    #[error("duplicate collection '{name}' found in: '{second}' and '{first}'")]
    DuplicateCollection {
        name: String,
        first: String,
        second: String,
    },
}

impl GroxError {
    pub fn project_not_found(tenant_id: impl Into<String>, project_code: impl Into<String>) -> Self {
        Self::ProjectNotFound {
            tenant_id: tenant_id.into(),
            project_code: project_code.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn connection(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::BackendConnection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// True for caller errors that name something unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound { .. } | Self::CollectionNotFound(_)
        )
    }

    /// True for errors caused by an invalid enumerated or formatted value.
    pub fn is_invalid_value(&self) -> bool {
        matches!(
            self,
            Self::InvalidTtl(_) | Self::UnsupportedBackend(_) | Self::UnsupportedSearchType(_)
        )
    }
}

/// Find a [`GroxError`] anywhere in an `anyhow` error chain.
pub fn classify(err: &anyhow::Error) -> Option<&GroxError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GroxError>())
}
