use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("policies")).unwrap();
    fs::write(
        files_dir.join("shipping.md"),
        "# Shipping\n\nWe ship to Canada and Mexico within five business days.\n\nExpress shipping is available at checkout.",
    )
    .unwrap();
    fs::write(
        files_dir.join("policies").join("returns.txt"),
        "Returns are accepted within thirty days.\n\nRefunds go back to the original payment method.",
    )
    .unwrap();
    fs::write(
        files_dir.join("hours.html"),
        "<html><head><title>Hours</title><script>var x = 1;</script></head><body><h1>Store hours</h1><p>Open weekdays from nine to five.</p></body></html>",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/sitechat.sqlite"

[storage]
blob_dir = "{root}/data/blobs"

[chunking]
chunk_tokens = 200
overlap_words = 10

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("sitechat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sitechat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_sitechat"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sitechat: {}", e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_sitechat(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/sitechat.sqlite").exists());
    assert!(tmp.path().join("data/blobs").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_sitechat(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_sitechat(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_kb_import_directory() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    run_sitechat(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_sitechat(&config_path, &["kb", "import", files.to_str().unwrap()]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files ingested: 3"), "got: {}", stdout);
    assert!(stdout.contains("files failed: 0"));

    let (stdout, _, success) = run_sitechat(&config_path, &["kb", "list"]);
    assert!(success);
    assert_eq!(stdout.matches("[ready]").count(), 3, "got: {}", stdout);
    assert!(stdout.contains("returns.txt"));
}

#[test]
fn test_search_falls_back_to_keywords_without_embeddings() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    run_sitechat(&config_path, &["init"]);
    run_sitechat(&config_path, &["kb", "import", files.to_str().unwrap()]);

    let (stdout, stderr, success) = run_sitechat(&config_path, &["search", "ship Canada"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("shipping.md"), "got: {}", stdout);
    assert!(!stdout.contains("returns.txt"));
}

#[test]
fn test_search_html_skips_scripts() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    run_sitechat(&config_path, &["init"]);
    run_sitechat(&config_path, &["kb", "import", files.to_str().unwrap()]);

    let (stdout, _, _) = run_sitechat(&config_path, &["search", "weekdays"]);
    assert!(stdout.contains("hours.html"), "got: {}", stdout);
    assert!(!stdout.contains("var x"));
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_sitechat(&config_path, &["init"]);
    let (stdout, _, success) = run_sitechat(&config_path, &["search", "anything"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_kb_delete_removes_from_search() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("files/shipping.md");

    run_sitechat(&config_path, &["init"]);
    let (stdout, _, success) =
        run_sitechat(&config_path, &["kb", "add", file.to_str().unwrap()]);
    assert!(success);
    let id = stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("id: "))
        .expect("kb add prints the id")
        .to_string();

    let (stdout, _, success) = run_sitechat(&config_path, &["kb", "delete", &id]);
    assert!(success);
    assert!(stdout.contains("Deleted"));

    let (stdout, _, _) = run_sitechat(&config_path, &["search", "Canada"]);
    assert!(stdout.contains("No results."));

    let (_, stderr, success) = run_sitechat(&config_path, &["kb", "delete", &id]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_chat_requires_configured_agent() {
    let (_tmp, config_path) = setup_test_env();

    run_sitechat(&config_path, &["init"]);
    let (_, stderr, success) = run_sitechat(&config_path, &["chat", "hello"]);
    assert!(!success);
    assert!(stderr.contains("not configured"), "got: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_sitechat(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
