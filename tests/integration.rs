use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kbe_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbe"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.html"),
        "<html><body><h1>Beta Document</h1><p>This document discusses Python and machine learning.</p><script>var x = 1;</script></body></html>",
    )
    .unwrap();
    fs::write(
        files_dir.join("nested/gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("slides.pptx"), b"not supported").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/kbe.sqlite"

[chunking]
strategy = "recursive"
chunk_size = 400
chunk_overlap = 40

[retrieval]
top_k = 5
mode = "hybrid"

[embedding]
provider = "hashing"
dims = 128

[training]
workers = 2

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = config_dir.join("kbe.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kbe(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbe_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kbe binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Create the `docs` knowledge base and import the fixture folder.
fn setup_trained(config_path: &Path, root: &Path) {
    let (_, stderr, success) = run_kbe(config_path, &["kb", "create", "docs"]);
    assert!(success, "kb create failed: {}", stderr);
    let files = root.join("files");
    let (_, stderr, success) = run_kbe(config_path, &["add", "docs", files.to_str().unwrap()]);
    assert!(success, "add failed: {}", stderr);
    let (stdout, stderr, success) = run_kbe(config_path, &["train", "docs", "--progress", "off"]);
    assert!(success, "train failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kbe(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/kbe.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kbe(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_kbe(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_kb_names_are_unique() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kbe(&config_path, &["kb", "create", "docs", "--chunk-size", "300"]);
    assert!(success);
    assert!(stdout.contains("created"));

    let (_, stderr, success) = run_kbe(&config_path, &["kb", "create", "docs"]);
    assert!(!success, "duplicate name must fail");
    assert!(stderr.contains("already exists"), "stderr: {}", stderr);

    let (stdout, _, success) = run_kbe(&config_path, &["kb", "show", "docs"]);
    assert!(success);
    let kb: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(kb["chunking"]["chunk_size"], 300);
    assert_eq!(kb["embedding_model"], "hashing:bow-128");
    assert_eq!(kb["vector_backend"], "sqlite");
}

#[test]
fn test_folder_import_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    run_kbe(&config_path, &["kb", "create", "docs"]);
    let files = tmp.path().join("files");

    let (stdout, stderr, success) = run_kbe(&config_path, &["add", "docs", files.to_str().unwrap()]);
    assert!(success, "add failed: {}", stderr);
    assert!(stdout.contains("3 added, 0 unchanged, 1 unsupported"), "{}", stdout);
    assert!(stdout.contains("nested/gamma.txt"));

    let (stdout, _, success) = run_kbe(&config_path, &["add", "docs", files.to_str().unwrap()]);
    assert!(success);
    assert!(stdout.contains("0 added, 3 unchanged, 1 unsupported"), "{}", stdout);

    let (stdout, _, _) = run_kbe(&config_path, &["status", "docs"]);
    assert!(stdout.contains("3 pending"), "{}", stdout);
}

#[test]
fn test_train_and_query() {
    let (tmp, config_path) = setup_test_env();
    setup_trained(&config_path, tmp.path());

    let (stdout, _, success) = run_kbe(&config_path, &["status", "docs", "--json"]);
    assert!(success);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["counts"]["ready"], 3);
    assert_eq!(status["ready_for_query"], true);

    let (stdout, stderr, success) = run_kbe(
        &config_path,
        &["query", "docs", "kubernetes docker", "--mode", "keyword", "--json"],
    );
    assert!(success, "query failed: {}", stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let top = &response["results"][0];
    assert_eq!(top["citation"]["document_name"], "nested/gamma.txt");
    assert_eq!(top["rank"], 1);

    let (stdout, _, success) = run_kbe(&config_path, &["query", "docs", "python machine learning"]);
    assert!(success);
    assert!(stdout.starts_with("1. ["), "{}", stdout);
    assert!(stdout.contains("beta.html"));
    assert!(!stdout.contains("var x"));
}

#[test]
fn test_retrain_skips_ready_documents() {
    let (tmp, config_path) = setup_test_env();
    setup_trained(&config_path, tmp.path());

    let (stdout, _, success) = run_kbe(&config_path, &["train", "docs", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("0 ready, 0 failed, 3 skipped"), "{}", stdout);

    let (stdout, _, success) = run_kbe(&config_path, &["train", "docs", "--force", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("3 ready"), "{}", stdout);
}

#[test]
fn test_invalid_top_k_fails() {
    let (tmp, config_path) = setup_test_env();
    setup_trained(&config_path, tmp.path());

    let (_, stderr, success) = run_kbe(&config_path, &["query", "docs", "rust", "--top-k", "0"]);
    assert!(!success);
    assert!(stderr.contains("top_k"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_kb_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_kbe(&config_path, &["status", "missing"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_completions_need_no_config() {
    let output = Command::new(kbe_binary())
        .args(["--config", "/nonexistent/kbe.toml", "completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("kbe"));
}
