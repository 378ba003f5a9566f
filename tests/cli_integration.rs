mod common;

use std::path::{Path, PathBuf};
use std::process::Command;

use common::{project_yaml, Fixture};

fn grox_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_grox"))
}

fn run_grox(config: &Path, args: &[&str]) -> (bool, String, String) {
    let output = Command::new(grox_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run grox binary");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn setup() -> (Fixture, PathBuf) {
    let fx = Fixture::new();
    fx.support_project();
    fx.app_config(&["support.yaml"]);
    let config = fx.path().join("grox.yaml");
    (fx, config)
}

#[test]
fn test_projects_lists_registered_project() {
    let (_fx, config) = setup();
    let (ok, stdout, stderr) = run_grox(&config, &["projects"]);
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("\"project_code\": \"support\""));
    assert!(stdout.contains("\"faq\""));
}

#[test]
fn test_search_returns_matching_snippet() {
    let (_fx, config) = setup();
    let (ok, stdout, stderr) = run_grox(
        &config,
        &["search", "acme", "support", "faq", "refund requests", "--limit", "1"],
    );
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("Refund requests are accepted within thirty days"));
    assert!(!stdout.contains("Shipping"));
}

#[test]
fn test_search_rejects_unknown_mode() {
    let (_fx, config) = setup();
    let (ok, _stdout, stderr) = run_grox(
        &config,
        &["search", "acme", "support", "faq", "refund", "--mode", "fuzzy"],
    );
    assert!(!ok);
    assert!(stderr.contains("unsupported search type: 'fuzzy'"));
}

#[test]
fn test_run_streams_reply() {
    let (_fx, config) = setup();
    let (ok, stdout, stderr) = run_grox(
        &config,
        &["run", "acme", "support", "--session", "s-1", "--input", "message=hello"],
    );
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("hello"));
    assert!(stdout.contains("[done: acme:support:s-1]"));
    assert!(stdout.contains("checkpoint: "));
}

#[test]
fn test_failed_project_is_reported_but_others_run() {
    let fx = Fixture::new();
    fx.support_project();
    fx.write(
        "broken.yaml",
        &project_yaml("broken", "    vector:\n      backend: redis\n", &["faq.yaml"]),
    );
    fx.app_config(&["support.yaml", "broken.yaml"]);
    let config = fx.path().join("grox.yaml");

    let (ok, stdout, stderr) = run_grox(&config, &["projects"]);
    assert!(ok, "stderr: {stderr}");
    assert!(stderr.contains("unsupported backend: 'redis'"));
    assert!(stdout.contains("\"project_code\": \"support\""));
    assert!(!stdout.contains("\"project_code\": \"broken\""));
}
