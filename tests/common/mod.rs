#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use grox::config::{load_app_config, AppConfig};
use tempfile::TempDir;

pub const FAQ: &str = r#"collections:
  - name: faq
    description: Customer support answers
    data:
      - documents:
          - "Refund requests are accepted within thirty days"
          - "Shipping takes three business days"
        metadata:
          source: handbook
      - documents:
          - "Support is available on weekdays"
          - "Refund requests are accepted within thirty days"
        metadata:
          source: site
  - name: policies
    data:
      - documents:
          - "Passwords rotate every ninety days"
"#;

pub const MEMORY_BACKENDS: &str = r#"    checkpoint:
      backend: memory
    history:
      backend: memory
    vector:
      backend: memory
"#;

pub fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// Project document with a local embedding model, `backends` spliced
/// under `infrastructure.backends` and `documents` listed for
/// orchestration.
pub fn project_yaml(code: &str, backends: &str, documents: &[&str]) -> String {
    let mut yaml = format!(
        r#"version: "1.0.0"
metadata:
  title: {code} project
  project: {code}
infrastructure:
  models:
    chat:
      provider: openai
      model: gpt-4o-mini
    embed:
      provider: local
      model: hashing
      kind: embedding
      dims: 256
  defaults:
    chat: chat
    embedding: embed
  backends:
{backends}"#
    );
    if !documents.is_empty() {
        yaml.push_str("orchestration:\n  documents:\n");
        for doc in documents {
            yaml.push_str(&format!("    - {doc}\n"));
        }
    }
    yaml
}

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            dir: TempDir::new().unwrap(),
        };
        fixture.write("faq.yaml", FAQ);
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        write(self.dir.path(), name, content)
    }

    /// App config listing `projects` (file names) under tenant `acme`.
    pub fn app_config(&self, projects: &[&str]) -> AppConfig {
        let mut yaml = String::from("service: grox-test\nenvironment: test\nlog_level: warn\ntenants:\n  acme:\n");
        for p in projects {
            yaml.push_str(&format!("    - {p}\n"));
        }
        let path = self.write("grox.yaml", &yaml);
        load_app_config(&path).unwrap()
    }

    /// The standard `support` project: memory backends over `faq.yaml`.
    pub fn support_project(&self) -> PathBuf {
        self.write(
            "support.yaml",
            &project_yaml("support", MEMORY_BACKENDS, &["faq.yaml"]),
        )
    }
}
