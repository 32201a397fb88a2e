//! CLI smoke tests: run the built `scoreport` binary against a temp config.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn scoreport_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("scoreport");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/scoreport.sqlite"

[import]
lock_ttl_secs = 60

[orphans]
max_attempts = 2

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("scoreport.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_scoreport(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = scoreport_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run scoreport binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// A fervidex play on a chart the (empty) catalog does not know.
fn write_plays(dir: &Path) -> PathBuf {
    let path = dir.join("plays.jsonl");
    fs::write(
        &path,
        r#"{"chart":"spa","entry_id":1000,"ex_score":68,"pgreat":34,"great":0,"good":0,"bad":0,"poor":6,"fast":0,"slow":0,"combo_break":6,"clear_type":1,"gauge":[100,50]}"#,
    )
    .unwrap();
    path
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_scoreport(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/scoreport.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_scoreport(&config_path, &["init"]);
    let (_, stderr, second) = run_scoreport(&config_path, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_scoreport(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_import_orphans_unknown_chart_then_retries() {
    let (tmp, config_path) = setup_test_env();
    run_scoreport(&config_path, &["init"]);
    let plays = write_plays(tmp.path());

    let (stdout, stderr, success) = run_scoreport(
        &config_path,
        &[
            "import",
            "ir/fervidex",
            plays.to_str().unwrap(),
            "--user",
            "1",
            "--context",
            r#"{"version": "27", "timeReceived": 10}"#,
        ],
    );
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("status: done"));
    assert!(stdout.contains("orphaned: 1"));

    let (stdout, _, success) = run_scoreport(&config_path, &["orphans", "list", "--user", "1"]);
    assert!(success);
    assert!(stdout.contains("ir/fervidex"));
    assert!(stdout.contains("1 orphan(s)"));

    // Two failed attempts reach the ceiling of 2.
    for _ in 0..2 {
        let (_, stderr, success) = run_scoreport(&config_path, &["orphans", "reconcile"]);
        assert!(success, "reconcile failed: {}", stderr);
    }
    let (stdout, _, _) = run_scoreport(&config_path, &["orphans", "list"]);
    assert!(stdout.contains("exhausted"));

    let (stdout, _, success) = run_scoreport(&config_path, &["orphans", "purge", "--exhausted"]);
    assert!(success);
    assert!(stdout.contains("purged 1 exhausted orphan(s)"));
}

#[test]
fn test_import_rejects_bad_context() {
    let (tmp, config_path) = setup_test_env();
    run_scoreport(&config_path, &["init"]);
    let plays = write_plays(tmp.path());

    let (stdout, _, success) = run_scoreport(
        &config_path,
        &["import", "ir/fervidex", plays.to_str().unwrap(), "--user", "1"],
    );
    assert!(!success);
    assert!(stdout.contains("status: failed"));
    assert!(stdout.contains("invalid import context"));
}

#[test]
fn test_background_import_prints_pollable_id() {
    let (tmp, config_path) = setup_test_env();
    run_scoreport(&config_path, &["init"]);
    let plays = write_plays(tmp.path());

    let (stdout, stderr, success) = run_scoreport(
        &config_path,
        &[
            "import",
            "ir/fervidex",
            plays.to_str().unwrap(),
            "--user",
            "1",
            "--context",
            r#"{"version": "27", "timeReceived": 10}"#,
            "--background",
        ],
    );
    assert!(success, "background import failed: {}", stderr);
    let import_id = stdout.lines().next().unwrap().trim().to_string();
    assert_eq!(import_id.len(), 36);

    let (stdout, _, success) = run_scoreport(&config_path, &["imports", "show", &import_id]);
    assert!(success);
    assert!(stdout.contains(&import_id));
    assert!(stdout.contains("status: done"));
}

#[test]
fn test_locks_sweep_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    run_scoreport(&config_path, &["init"]);

    let (stdout, _, success) = run_scoreport(&config_path, &["locks", "sweep", "--all"]);
    assert!(success);
    assert!(stdout.contains("removed 0 lock(s)"));

    let (stdout, _, success) = run_scoreport(&config_path, &["blacklist", "add", "Rdeadbeef", "--user", "1"]);
    assert!(success);
    assert!(stdout.contains("blacklisted Rdeadbeef"));

    let (stdout, _, success) = run_scoreport(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Scores:          0"));
    assert!(stdout.contains("Blacklisted:     1"));
}

#[test]
fn test_purge_requires_exhausted_flag() {
    let (_tmp, config_path) = setup_test_env();
    run_scoreport(&config_path, &["init"]);

    let (_, stderr, success) = run_scoreport(&config_path, &["orphans", "purge"]);
    assert!(!success);
    assert!(stderr.contains("--exhausted"));
}
