//! Configuration parsing and validation.
//!
//! Two documents drive grox:
//!
//! | Document | Type | Loaded by |
//! |----------|------|-----------|
//! | App config | [`AppConfig`] | [`load_app_config`] |
//! | Project config | [`ProjectConfig`] | [`load_project_config`] |
//!
//! Both are read from YAML, TOML or JSON, selected by file extension.
//! Relative paths inside a document resolve against that document's
//! directory. Project configs are validated eagerly by
//! [`ProjectConfig::validate`]; backend configs are turned into the tagged
//! [`BackendSpec`] by [`BackendConfig::resolve`].

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use grox_core::ttl::parse_ttl;
use grox_core::GroxError;

use crate::logging::LogCallback;

/// Only project-config schema version understood by this build.
pub const PROJECT_SCHEMA_VERSION: &str = "1.0.0";

// ============ Secrets ============

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

// ============ App config ============

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Tenant id to project-config document paths.
    #[serde(default)]
    pub tenants: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    /// Receives a copy of every log event; set programmatically.
    #[serde(skip)]
    pub log_callback: Option<LogCallback>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            environment: default_environment(),
            log_level: default_log_level(),
            tenants: BTreeMap::new(),
            server: ServerConfig::default(),
            indexing: IndexingConfig::default(),
            log_callback: None,
        }
    }
}

fn default_service() -> String {
    "grox".to_string()
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    /// Maximum number of collections indexed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

// ============ Project config ============

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub version: String,
    pub metadata: ProjectMetadata,
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectMetadata {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Project code; unique per tenant.
    pub project: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_workspace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfrastructureConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub defaults: ModelDefaults,
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Names of the models used when a caller does not pick one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDefaults {
    #[serde(default)]
    pub chat: Option<String>,
    #[serde(default)]
    pub embedding: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub checkpoint: Option<BackendConfig>,
    #[serde(default)]
    pub history: Option<BackendConfig>,
    #[serde(default)]
    pub vector: Option<BackendConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestrationConfig {
    /// Document collection files.
    #[serde(default)]
    pub documents: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Openai,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Chat,
    Embedding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub model: String,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

// ============ Backends ============

/// Backend config as written in a project document.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub backend: String,
    #[serde(default)]
    pub url: Option<SecretString>,
    #[serde(default)]
    pub ttl: Option<String>,
    #[serde(default)]
    pub sync: bool,
}

impl BackendConfig {
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            url: None,
            ttl: None,
            sync: false,
        }
    }

    pub fn sqlite(url: impl Into<String>, ttl: Option<&str>) -> Self {
        Self {
            backend: "sqlite".to_string(),
            url: Some(SecretString::new(url)),
            ttl: ttl.map(str::to_string),
            sync: false,
        }
    }

    /// Validate into a [`BackendSpec`].
    ///
    /// Fails with [`GroxError::InvalidTtl`], [`GroxError::UnsupportedBackend`]
    /// or, for a `sqlite` backend without `url`, [`GroxError::ConfigValidation`].
    pub fn resolve(&self) -> Result<BackendSpec, GroxError> {
        let ttl_seconds = parse_ttl(self.ttl.as_deref())?;
        match self.backend.as_str() {
            "memory" => Ok(BackendSpec::Memory),
            "sqlite" => {
                let url = self
                    .url
                    .clone()
                    .filter(|u| !u.expose_secret().trim().is_empty())
                    .ok_or_else(|| GroxError::config("sqlite backend requires a url"))?;
                Ok(BackendSpec::Sqlite {
                    url,
                    ttl_seconds,
                    sync: self.sync,
                })
            }
            other => Err(GroxError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// A validated backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// In-process storage.
    Memory,
    /// SQLite database reached through a pooled connection.
    Sqlite {
        url: SecretString,
        ttl_seconds: Option<u64>,
        sync: bool,
    },
}

impl BackendSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendSpec::Memory => "memory",
            BackendSpec::Sqlite { .. } => "sqlite",
        }
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        match self {
            BackendSpec::Memory => None,
            BackendSpec::Sqlite { ttl_seconds, .. } => *ttl_seconds,
        }
    }
}

// ============ Validation ============

impl ProjectConfig {
    pub fn project_code(&self) -> &str {
        &self.metadata.project
    }

    /// Check internal consistency. Runs before any resource is built.
    pub fn validate(&self) -> Result<(), GroxError> {
        if self.version != PROJECT_SCHEMA_VERSION {
            return Err(GroxError::config(format!(
                "unsupported project schema version '{}', expected '{}'",
                self.version, PROJECT_SCHEMA_VERSION
            )));
        }
        if self.metadata.project.trim().is_empty() {
            return Err(GroxError::config("metadata.project must not be empty"));
        }

        let infra = &self.infrastructure;
        for (name, model) in &infra.models {
            if model.model.trim().is_empty() {
                return Err(GroxError::config(format!(
                    "models.{name}.model must not be empty"
                )));
            }
            if model.kind == ModelKind::Embedding
                && model.provider == ModelProvider::Openai
                && model.dims.unwrap_or(0) == 0
            {
                return Err(GroxError::config(format!(
                    "models.{name}.dims must be > 0 for openai embedding models"
                )));
            }
        }

        self.check_default("chat", infra.defaults.chat.as_deref(), ModelKind::Chat)?;
        self.check_default(
            "embedding",
            infra.defaults.embedding.as_deref(),
            ModelKind::Embedding,
        )?;

        if !self.orchestration.documents.is_empty() {
            if infra.defaults.embedding.is_none() {
                return Err(GroxError::config(
                    "document collections require defaults.embedding",
                ));
            }
            if infra.backends.vector.is_none() {
                return Err(GroxError::config(
                    "document collections require backends.vector",
                ));
            }
        }

        for backend in [
            &infra.backends.checkpoint,
            &infra.backends.history,
            &infra.backends.vector,
        ]
        .into_iter()
        .flatten()
        {
            backend.resolve()?;
        }

        Ok(())
    }

    fn check_default(
        &self,
        role: &str,
        name: Option<&str>,
        kind: ModelKind,
    ) -> Result<(), GroxError> {
        let Some(name) = name else {
            return Ok(());
        };
        match self.infrastructure.models.get(name) {
            None => Err(GroxError::config(format!(
                "defaults.{role} references unknown model '{name}'"
            ))),
            Some(model) if model.kind != kind => Err(GroxError::config(format!(
                "defaults.{role} references model '{name}' of kind {:?}",
                model.kind
            ))),
            Some(_) => Ok(()),
        }
    }
}

// ============ Loading ============

/// Read and deserialize a YAML, TOML or JSON document.
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(anyhow::Error::from),
        "toml" => toml::from_str(&content).map_err(anyhow::Error::from),
        "json" => serde_json::from_str(&content).map_err(anyhow::Error::from),
        other => bail!(
            "Unsupported document format '{}' for {}. Use .yaml, .toml or .json",
            other,
            path.display()
        ),
    };
    parsed.with_context(|| format!("Failed to parse {}", path.display()))
}

fn resolve_relative(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

pub fn load_app_config(path: &Path) -> Result<AppConfig> {
    let mut config: AppConfig = read_document(path)?;
    let base = path.parent();
    for paths in config.tenants.values_mut() {
        for p in paths.iter_mut() {
            *p = resolve_relative(base, p);
        }
    }

    if config.indexing.concurrency == 0 {
        bail!("indexing.concurrency must be > 0");
    }
    if config.tenants.keys().any(|t| t.trim().is_empty()) {
        bail!("tenant ids must not be empty");
    }

    Ok(config)
}

/// Anchor a relative `sqlite:` file URL at `base`. Other URLs pass through.
fn resolve_sqlite_url(base: Option<&Path>, url: &str) -> Option<String> {
    let base = base?;
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let (file, query) = match rest.split_once('?') {
        Some((file, query)) => (file, Some(query)),
        None => (rest, None),
    };
    if file.is_empty() || file == ":memory:" || Path::new(file).is_absolute() {
        return None;
    }
    let mut resolved = format!("sqlite://{}", base.join(file).display());
    if let Some(query) = query {
        resolved.push('?');
        resolved.push_str(query);
    }
    Some(resolved)
}

/// Load a project config. Document paths and relative SQLite file URLs
/// are resolved against the file's directory. Does not validate.
pub fn load_project_config(path: &Path) -> Result<ProjectConfig> {
    let mut config: ProjectConfig = read_document(path)?;
    let base = path.parent();
    for doc in config.orchestration.documents.iter_mut() {
        *doc = resolve_relative(base, doc);
    }
    let backends = &mut config.infrastructure.backends;
    for backend in [
        &mut backends.checkpoint,
        &mut backends.history,
        &mut backends.vector,
    ]
    .into_iter()
    .flatten()
    {
        if let Some(url) = &backend.url {
            if let Some(resolved) = resolve_sqlite_url(base, url.expose_secret()) {
                backend.url = Some(SecretString::new(resolved));
            }
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const PROJECT_YAML: &str = r#"
version: "1.0.0"
metadata:
  title: Support bot
  project: support
infrastructure:
  models:
    gpt:
      provider: openai
      model: gpt-4o-mini
      kind: chat
    embed:
      provider: local
      model: local-hash
      kind: embedding
      dims: 64
  defaults:
    chat: gpt
    embedding: embed
  backends:
    checkpoint:
      backend: memory
    vector:
      backend: memory
orchestration:
  documents:
    - docs/faq.yaml
"#;

    fn project() -> ProjectConfig {
        serde_yaml::from_str(PROJECT_YAML).unwrap()
    }

    #[test]
    fn test_valid_project_passes() {
        let cfg = project();
        cfg.validate().unwrap();
        assert_eq!(cfg.project_code(), "support");
        assert_eq!(cfg.metadata.workspace, "default");
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut cfg = project();
        cfg.version = "2.0.0".into();
        assert!(matches!(
            cfg.validate(),
            Err(GroxError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_default_must_reference_known_model() {
        let mut cfg = project();
        cfg.infrastructure.defaults.embedding = Some("missing".into());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_default_kind_must_match() {
        let mut cfg = project();
        cfg.infrastructure.defaults.embedding = Some("gpt".into());
        assert!(matches!(
            cfg.validate(),
            Err(GroxError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_documents_require_vector_backend() {
        let mut cfg = project();
        cfg.infrastructure.backends.vector = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("backends.vector"));
    }

    #[test]
    fn test_backend_errors_surface_from_validate() {
        let mut cfg = project();
        cfg.infrastructure.backends.checkpoint = Some(BackendConfig {
            backend: "unsupported".into(),
            url: None,
            ttl: None,
            sync: false,
        });
        assert_eq!(
            cfg.validate(),
            Err(GroxError::UnsupportedBackend("unsupported".into()))
        );
    }

    #[test]
    fn test_resolve_backend_kinds() {
        assert_eq!(BackendConfig::memory().resolve().unwrap(), BackendSpec::Memory);

        let spec = BackendConfig::sqlite("sqlite://grox.db", Some("2h"))
            .resolve()
            .unwrap();
        assert_eq!(spec.kind(), "sqlite");
        assert_eq!(spec.ttl_seconds(), Some(7200));

        let missing_url = BackendConfig {
            backend: "sqlite".into(),
            url: None,
            ttl: None,
            sync: false,
        };
        assert!(matches!(
            missing_url.resolve(),
            Err(GroxError::ConfigValidation(_))
        ));

        let bad_ttl = BackendConfig::sqlite("sqlite://grox.db", Some("3x"));
        assert_eq!(bad_ttl.resolve(), Err(GroxError::InvalidTtl("3x".into())));
    }

    #[test]
    fn test_secret_is_redacted() {
        let cfg = BackendConfig::sqlite("sqlite://user:hunter2@db", None);
        let shown = format!("{:?}", cfg);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("***"));
    }

    #[test]
    fn test_load_app_config_resolves_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grox.toml");
        fs::write(
            &path,
            r#"
service = "support-api"
log_level = "debug"

[tenants]
acme = ["projects/support.yaml"]

[server]
bind = "0.0.0.0:9000"
"#,
        )
        .unwrap();

        let cfg = load_app_config(&path).unwrap();
        assert_eq!(cfg.service, "support-api");
        assert_eq!(cfg.environment, "production");
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.indexing.concurrency, 4);
        assert_eq!(
            cfg.tenants["acme"],
            vec![tmp.path().join("projects/support.yaml")]
        );
    }

    #[test]
    fn test_relative_sqlite_url_follows_project_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("support.yaml");
        fs::write(
            &path,
            r#"
version: "1.0.0"
metadata:
  title: Support
  project: support
infrastructure:
  backends:
    checkpoint:
      backend: sqlite
      url: "sqlite://data/grox.db?mode=rwc"
    history:
      backend: sqlite
      url: "sqlite::memory:"
    vector:
      backend: sqlite
      url: "sqlite:///var/lib/grox.db"
"#,
        )
        .unwrap();

        let cfg = load_project_config(&path).unwrap();
        let url = |b: &Option<BackendConfig>| {
            b.as_ref().unwrap().url.as_ref().unwrap().expose_secret().to_string()
        };
        let backends = &cfg.infrastructure.backends;
        assert_eq!(
            url(&backends.checkpoint),
            format!("sqlite://{}?mode=rwc", tmp.path().join("data/grox.db").display())
        );
        assert_eq!(url(&backends.history), "sqlite::memory:");
        assert_eq!(url(&backends.vector), "sqlite:///var/lib/grox.db");
    }

    #[test]
    fn test_load_project_config_json_and_yaml_agree() {
        let tmp = TempDir::new().unwrap();
        let yaml_path = tmp.path().join("p.yaml");
        fs::write(&yaml_path, PROJECT_YAML).unwrap();
        let from_yaml = load_project_config(&yaml_path).unwrap();

        let json_path = tmp.path().join("p.json");
        fs::write(
            &json_path,
            r#"{"version":"1.0.0","metadata":{"title":"t","project":"support"},
                "orchestration":{"documents":["docs/faq.yaml"]}}"#,
        )
        .unwrap();
        let from_json = load_project_config(&json_path).unwrap();

        assert_eq!(from_yaml.project_code(), from_json.project_code());
        assert_eq!(
            from_yaml.orchestration.documents,
            vec![tmp.path().join("docs/faq.yaml")]
        );
        assert_eq!(
            from_json.orchestration.documents,
            from_yaml.orchestration.documents
        );
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grox.ini");
        fs::write(&path, "x=1").unwrap();
        let err = load_app_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported document format"));
    }
}
