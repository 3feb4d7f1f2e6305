use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    // Two workspace containers laid out like VS Code's workspaceStorage
    let storage = root.join("workspaceStorage");
    let alpha = storage.join("3f1c9a");
    let beta = storage.join("8be0d2");
    fs::create_dir_all(alpha.join("chatSessions")).unwrap();
    fs::create_dir_all(beta.join("chatSessions")).unwrap();
    fs::write(
        alpha.join("workspace.json"),
        r#"{"folder":"file:///home/dev/alpha%20service"}"#,
    )
    .unwrap();
    fs::write(beta.join("workspace.json"), r#"{"folder":"file:///home/dev/beta"}"#).unwrap();

    fs::write(
        alpha.join("chatSessions/s-edit.json"),
        r#"{"sessionId":"s-edit","requests":[{"message":{"text":"fix bug"},"timestamp":1700000000000,
            "response":[{"kind":"textEditGroup","uri":{"fsPath":"/home/dev/alpha service/main.go"},
            "edits":[[{"range":{"startLineNumber":10,"endLineNumber":12},"text":"fixed"}]]}]}]}"#,
    )
    .unwrap();
    fs::write(
        alpha.join("chatSessions/s-chat.json"),
        r#"{"sessionId":"s-chat","requests":[{"message":{"text":"How do lifetimes work?"},
            "timestamp":1700003600000,"response":[{"value":"They describe how long references live."}]}]}"#,
    )
    .unwrap();
    fs::write(
        beta.join("chatSessions/legacy.json"),
        r#"[{"role":"user","content":"hello","timestamp":1700100000},
            {"role":"assistant","content":"hi there","timestamp":1700100060}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[source]
root = "{}"
include_globs = ["chatSessions/*.json"]

[sync]
parallelism = 2
"#,
        root.display(),
        storage.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/harvest.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_harvest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_containers() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("alpha service"));
    assert!(stdout.contains("beta"));
    assert!(stdout.contains("2 containers, 2 with sessions, 3 session files"));
}

#[test]
fn test_sync_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["sync"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("seen: 3 sessions"));
    assert!(stdout.contains("new: 3"));
    assert!(stdout.contains("workspaces: 2"));
    assert!(stdout.contains("2 conversation / 0 code_edit / 1 mixed"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_sync_incremental() {
    let (tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    run_harvest(&config_path, &["sync"]);

    let (stdout, _, _) = run_harvest(&config_path, &["sync"]);
    assert!(
        stdout.contains("unchanged: 3") && stdout.contains("new: 0"),
        "Expected nothing to change on a repeat sync, got: {}",
        stdout
    );

    fs::write(
        tmp.path()
            .join("workspaceStorage/8be0d2/chatSessions/legacy.json"),
        r#"[{"role":"user","content":"hello again"}]"#,
    )
    .unwrap();

    let (stdout, _, _) = run_harvest(&config_path, &["sync"]);
    assert!(
        stdout.contains("updated: 1") && stdout.contains("unchanged: 2"),
        "Expected 1 session updated after modification, got: {}",
        stdout
    );
}

#[test]
fn test_sync_dry_run() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, _, success) = run_harvest(&config_path, &["sync", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("new: 3"));

    // Nothing was written, so a real sync still sees everything as new
    let (stdout, _, _) = run_harvest(&config_path, &["sync"]);
    assert!(stdout.contains("new: 3"));
}

#[test]
fn test_sync_missing_root_fails() {
    let (tmp, config_path) = setup_test_env();

    let missing = tmp.path().join("nowhere");
    let (_, stderr, success) = run_harvest(
        &config_path,
        &["sync", "--root", missing.to_str().unwrap()],
    );
    assert!(!success, "sync against a missing root should fail");
    assert!(stderr.contains("configuration error"), "stderr: {}", stderr);
}

#[test]
fn test_stats_after_sync() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    run_harvest(&config_path, &["sync"]);

    let (stdout, stderr, success) = run_harvest(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Sessions:    3"));
    assert!(stdout.contains("Workspaces:  2"));
    assert!(stdout.contains("alpha service"));
    assert!(stdout.contains("Runs:        1 (0 failed)"));
    assert!(stdout.contains("Recent activity:"));
    assert!(stdout.contains("2023-11-14"));
    assert!(stdout.contains("2023-11-16"));
}

#[test]
fn test_export_writes_units() {
    let (tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    run_harvest(&config_path, &["sync"]);

    let out = tmp.path().join("out/units.json");
    let (_, stderr, success) = run_harvest(
        &config_path,
        &["export", "--output", out.to_str().unwrap(), "--workspace", "alpha service"],
    );
    assert!(success, "export failed: {}", stderr);

    let units: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    let units = units.as_array().unwrap();
    assert_eq!(units.len(), 2);

    let edit = units.iter().find(|u| u["session_id"] == "s-edit").unwrap();
    assert_eq!(edit["session_type"], "mixed");
    assert_eq!(edit["text"], "fix bug");
    assert_eq!(edit["fingerprint"].as_str().unwrap().len(), 64);
}
