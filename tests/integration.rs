use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn curator_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("curator");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // No provider is reachable in tests; every command exercised here must
    // work without leaving the machine.
    let config_content = format!(
        r#"[archive]
root = "{root}/data/archive"

[index]
path = "{root}/data/curator.sqlite"

[queue]
root = "{root}/data/queue"

[embedder.global]
provider = "ollama"
model = "mxbai-embed-large"
url = "http://127.0.0.1:1"

[embedder.chunk]
provider = "ollama"
model = "mxbai-embed-large"
url = "http://127.0.0.1:1"

[llm]
provider = "ollama"
model = "test-model"
base_url = "http://127.0.0.1:1"
max_retries = 0

[fetcher]
max_retries = 0
timeout_secs = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("curator.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_curator(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = curator_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run curator binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Write an archive record fixture the way the pipeline would.
fn write_archive_fixture(root: &Path, video_id: &str, tags: &[&str]) {
    let dir = root
        .join("data/archive/youtube_video/2026-03");
    fs::create_dir_all(&dir).unwrap();

    let record = serde_json::json!({
        "id": format!("youtube:{}", video_id),
        "kind": "youtube_video",
        "provenance": {
            "url": format!("https://www.youtube.com/watch?v={}", video_id),
            "source": "Some Channel",
            "fetched_at": "2026-03-14T12:00:00Z"
        },
        "raw_text": "hello transcript words",
        "raw_metadata": {
            "video": {"title": "A video", "channel": "Some Channel"},
            "segments": [
                {"start": 0.0, "duration": 2.0, "text": "hello transcript"},
                {"start": 2.0, "duration": 2.0, "text": "words"}
            ]
        },
        "llm_outputs": [{
            "output_type": "structured_metadata",
            "attempt": 1,
            "model": "test-model",
            "prompt_id": "fixture",
            "input_tokens": 100,
            "output_tokens": 50,
            "cost_usd": 0.001,
            "wall_ms": 10,
            "value": {
                "title": "A video",
                "summary": "About things.",
                "subject_matter": tags,
                "entities": [],
                "techniques": [],
                "tools": []
            }
        }],
        "processing_records": []
    });

    fs::write(
        dir.join(format!("youtube:{}.json", video_id)),
        serde_json::to_string_pretty(&record).unwrap(),
    )
    .unwrap();
}

#[test]
fn test_init_creates_stores() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_curator(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    assert!(tmp.path().join("data/curator.sqlite").is_file());
    assert!(tmp.path().join("data/queue/pending").is_dir());
    assert!(tmp.path().join("data/queue/processing").is_dir());
    assert!(tmp.path().join("data/queue/completed").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_curator(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_curator(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_enqueue_writes_pending_item() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);

    let (stdout, stderr, success) = run_curator(
        &config_path,
        &[
            "enqueue",
            "https://www.youtube.com/watch?v=ABC123XYZ01",
            "--rating",
            "4.5",
            "--projects",
            "workshop;reading",
        ],
    );
    assert!(success, "enqueue failed: {} {}", stdout, stderr);

    let pending = tmp.path().join("data/queue/pending");
    let entries: Vec<_> = fs::read_dir(&pending).unwrap().collect();
    assert_eq!(entries.len(), 1);

    let body = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
    assert!(body.starts_with("url,"));
    assert!(body.contains("https://www.youtube.com/watch?v=ABC123XYZ01"));
    assert!(body.contains("workshop;reading"));
}

#[test]
fn test_enqueue_rejects_underivable_url() {
    let (_tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);

    let (_, _, success) = run_curator(&config_path, &["enqueue", "https://www.youtube.com/"]);
    assert!(!success, "enqueue should reject a URL without a video id");
}

#[test]
fn test_worker_recovers_and_terminally_fails_bad_item() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);

    // A crash left an item in processing; its URL cannot yield a content
    // id, so the worker should recover it and complete it as failed
    // without any network access.
    let processing = tmp.path().join("data/queue/processing");
    fs::write(
        processing.join("stranded.csv"),
        "url\nhttps://www.youtube.com/\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_curator(&config_path, &["ingest", "--once"]);
    assert!(success, "ingest failed: {} {}", stdout, stderr);

    let completed: Vec<_> = fs::read_dir(tmp.path().join("data/queue/completed"))
        .unwrap()
        .collect();
    assert_eq!(completed.len(), 1, "item should be terminally completed");
    assert_eq!(
        fs::read_dir(&processing).unwrap().count(),
        0,
        "processing should be drained"
    );
}

#[test]
fn test_search_empty_index_returns_no_results() {
    let (_tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);

    // With an empty index the query embeds nothing, so the unreachable
    // embedding endpoint is never contacted.
    let (stdout, stderr, success) =
        run_curator(&config_path, &["search", "anything at all"]);
    assert!(success, "search failed: {} {}", stdout, stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_vocab_seed_and_show() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);

    write_archive_fixture(tmp.path(), "AAAAAAAAAA1", &["rust", "ai-agents"]);
    write_archive_fixture(tmp.path(), "BBBBBBBBBB2", &["rust", "vector-search"]);

    let (stdout, stderr, success) = run_curator(&config_path, &["vocab", "seed", "--top-k", "10"]);
    assert!(success, "vocab seed failed: {} {}", stdout, stderr);
    assert!(stdout.contains("seeded v1"), "unexpected: {}", stdout);
    assert!(stdout.contains("3 canonical forms"), "unexpected: {}", stdout);

    let (stdout, _, success) = run_curator(&config_path, &["vocab", "show"]);
    assert!(success);
    assert!(stdout.contains("vocabulary v1"));
    // "rust" appears twice across the corpus, so it leads the list.
    assert!(stdout.contains("rust ×2"), "unexpected: {}", stdout);

    assert!(tmp.path().join("data/archive/vocabulary/v1.json").is_file());
}

#[test]
fn test_vocab_consolidate_produces_new_version() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);
    write_archive_fixture(tmp.path(), "AAAAAAAAAA1", &["agents", "rust"]);
    run_curator(&config_path, &["vocab", "seed"]);

    let proposals = tmp.path().join("proposals.json");
    fs::write(
        &proposals,
        r#"{"renames": [{"from": "agents", "to": "ai-agents"}]}"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_curator(
        &config_path,
        &[
            "vocab",
            "consolidate",
            proposals.to_str().unwrap(),
            "--activate",
        ],
    );
    assert!(success, "consolidate failed: {} {}", stdout, stderr);
    assert!(stdout.contains("v1 → v2"));

    // Both versions exist on disk; the alias resolves in the new one.
    assert!(tmp.path().join("data/archive/vocabulary/v1.json").is_file());
    assert!(tmp.path().join("data/archive/vocabulary/v2.json").is_file());

    let (stdout, _, _) = run_curator(&config_path, &["vocab", "show"]);
    assert!(stdout.contains("vocabulary v2"));
    assert!(stdout.contains("aliases: agents"));
}

#[test]
fn test_status_reports_queue_vocab_and_costs() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);
    write_archive_fixture(tmp.path(), "AAAAAAAAAA1", &["rust"]);
    run_curator(
        &config_path,
        &["enqueue", "https://www.youtube.com/watch?v=CCCCCCCCCC3"],
    );

    let (stdout, stderr, success) = run_curator(&config_path, &["status", "--costs"]);
    assert!(success, "status failed: {} {}", stdout, stderr);
    assert!(stdout.contains("pending: 1"));
    assert!(stdout.contains("active: none") || stdout.contains("active: v"));
    assert!(stdout.contains("llm calls: 1"));
    assert!(stdout.contains("$0.0010"));
}

#[test]
fn test_renormalize_requires_vocabulary() {
    let (tmp, config_path) = setup_test_env();
    run_curator(&config_path, &["init"]);
    write_archive_fixture(tmp.path(), "AAAAAAAAAA1", &["rust"]);

    let (stdout, stderr, success) = run_curator(&config_path, &["renormalize"]);
    assert!(
        !success,
        "renormalize without a vocabulary must fail: {} {}",
        stdout, stderr
    );
    assert!(
        stderr.contains("vocabulary") || stdout.contains("vocabulary"),
        "error should mention the missing vocabulary: {} {}",
        stdout,
        stderr
    );
}
