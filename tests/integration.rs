use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use framehub::artifacts::{ArtifactStore, Stage};
use framehub::status::StatusStore;

fn framehub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_framehub"))
}

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let storage = root.join("storage");
    fs::create_dir_all(&storage).unwrap();

    let config_content = format!(
        r#"[storage]
base_path = "{}"

[server]
bind = "127.0.0.1:0"

[workers]
name_prefix = "fhcli"
grace_period_secs = 1
kill_timeout_secs = 1
"#,
        storage.display()
    );

    let config_path = config_dir.join("framehub.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, storage)
}

fn run_framehub(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = framehub_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run framehub binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_status_prints_document() {
    let (_tmp, config, storage) = setup_test_env();
    let store = StatusStore::new(&storage);
    store.begin_indexing("s1", 2).unwrap();
    store.add_indexed_video("s1", "/videos/a.mp4").unwrap();

    let (stdout, stderr, ok) = run_framehub(&config, &["status", "s1"]);
    assert!(ok, "status failed: {}", stderr);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["indexing_status"]["status"], "processing");
    assert_eq!(doc["indexing_status"]["total_videos"], 2);
    assert_eq!(doc["indexed_videos"][0], "/videos/a.mp4");

    let (stdout, _, ok) = run_framehub(&config, &["status", "s1", "--kind", "index"]);
    assert!(ok);
    let ns: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(ns["processed_videos"], 1);
    assert!(ns.get("indexed_videos").is_none());
}

#[test]
fn test_status_unknown_session_fails() {
    let (_tmp, config, _) = setup_test_env();
    let (_, stderr, ok) = run_framehub(&config, &["status", "nope"]);
    assert!(!ok);
    assert!(stderr.contains("No status document"), "stderr: {}", stderr);
}

#[test]
fn test_progress_counts_completed_stages() {
    let (_tmp, config, storage) = setup_test_env();
    let artifacts = ArtifactStore::open(&storage, "s2").unwrap();
    artifacts
        .save_step_result(Stage::Upload, &serde_json::json!({"video": "a.mp4"}), None)
        .unwrap();
    artifacts
        .save_step_result(Stage::Split, &serde_json::json!({"segments": 3}), None)
        .unwrap();
    artifacts.begin_step(Stage::Transcribe).unwrap();

    let (stdout, stderr, ok) = run_framehub(&config, &["progress", "s2"]);
    assert!(ok, "progress failed: {}", stderr);
    assert!(stdout.contains("2/10 stages completed"), "stdout: {}", stdout);
    assert!(stdout.contains(Stage::Transcribe.dir_name()));
    assert!(stdout.contains("processing"));
}

#[test]
fn test_progress_unknown_session_fails() {
    let (_tmp, config, _) = setup_test_env();
    let (_, stderr, ok) = run_framehub(&config, &["progress", "missing"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_sweep_with_no_orphans() {
    let (_tmp, config, _) = setup_test_env();
    let (stdout, stderr, ok) = run_framehub(&config, &["sweep"]);
    assert!(ok, "sweep failed: {}", stderr);
    assert!(stdout.contains("No orphaned workers found."));
}

#[test]
fn test_missing_config_is_reported() {
    let (stdout, stderr, ok) = run_framehub(Path::new("/nonexistent/framehub.toml"), &["sweep"]);
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _, storage) = setup_test_env();
    let bad = tmp.path().join("bad.toml");
    fs::write(
        &bad,
        format!(
            "[storage]\nbase_path = \"{}\"\n\n[encoder]\nbackend = \"onnx\"\n",
            storage.display()
        ),
    )
    .unwrap();
    let (_, stderr, ok) = run_framehub(&bad, &["sweep"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown encoder backend"), "stderr: {}", stderr);
}

#[test]
fn test_worker_with_missing_job_file_fails() {
    let (tmp, config, _) = setup_test_env();
    let job = tmp.path().join("no-such-job.json");
    let (_, stderr, ok) = run_framehub(
        &config,
        &["worker", "index", "--job", job.to_str().unwrap()],
    );
    assert!(!ok);
    assert!(stderr.contains("Failed to read job file"), "stderr: {}", stderr);
}

#[test]
fn test_help_hides_worker() {
    let (_tmp, config, _) = setup_test_env();
    let (stdout, _, ok) = run_framehub(&config, &["--help"]);
    assert!(ok);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("sweep"));
    assert!(!stdout
        .lines()
        .any(|l| l.trim_start().starts_with("worker")));
}

#[test]
fn test_serve_shuts_down_cleanly_on_sigterm() {
    let (tmp, _, storage) = setup_test_env();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = tmp.path().join("serve.toml");
    fs::write(
        &config,
        format!(
            "[storage]\nbase_path = \"{}\"\n\n[server]\nbind = \"127.0.0.1:{}\"\n\n[workers]\nname_prefix = \"fhsigterm\"\n",
            storage.display(),
            port
        ),
    )
    .unwrap();

    let mut child = Command::new(framehub_binary())
        .arg("--config")
        .arg(&config)
        .arg("serve")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let http = reqwest::blocking::Client::new();
    let health = format!("http://127.0.0.1:{}/health", port);
    let deadline = Instant::now() + Duration::from_secs(20);
    while http.get(&health).send().is_err() {
        assert!(Instant::now() < deadline, "server never came up");
        std::thread::sleep(Duration::from_millis(100));
    }

    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().unwrap();
            panic!("server ignored SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(100));
    };
    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(status.success(), "stderr: {}", stderr);
    assert!(stderr.contains("received SIGTERM"), "stderr: {}", stderr);
    assert!(stderr.contains("shutting down, terminating workers"), "stderr: {}", stderr);
}
