//! TOML configuration.
//!
//! ```toml
//! [storage]
//! base_path = "./data/storage"
//!
//! [server]
//! bind = "127.0.0.1:7860"
//!
//! [encoder]
//! backend = "fastembed"        # or "disabled"
//! model_path = "clip-vit-b32"
//!
//! [collaborators]
//! splitter = ["python3", "tools/split.py"]
//! transcriber = ["python3", "tools/transcribe.py"]
//! captioner = ["python3", "tools/caption.py"]
//! embedder = ["python3", "tools/embed.py"]
//! ```
//!
//! Every other section is optional. The whole config is also serialized into
//! each worker's job file, so workers see exactly what the orchestrator saw.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Parent of every `chat-{id}` session directory.
    pub base_path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// URL workers use to reach the encoder service. Derived from `bind`
    /// when unset.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7860".to_string()
}

impl ServerConfig {
    /// Base URL handed to workers in their job file.
    pub fn encoder_base_url(&self) -> String {
        if let Some(url) = &self.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let bind = match self.bind.strip_prefix("0.0.0.0:") {
            Some(port) => format!("127.0.0.1:{}", port),
            None => self.bind.clone(),
        };
        format!("http://{}", bind)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model_path: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_backend() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    16
}

impl EncoderConfig {
    pub fn is_enabled(&self) -> bool {
        self.backend != "disabled"
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkersConfig {
    /// First part of every worker's argv[0] (`<prefix>-index-<session>`).
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            grace_period_secs: default_grace_period_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
        }
    }
}

fn default_name_prefix() -> String {
    "framehub".to_string()
}
fn default_grace_period_secs() -> u64 {
    5
}
fn default_kill_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            encode_timeout_secs: default_encode_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
        }
    }
}

fn default_encode_timeout_secs() -> u64 {
    1800
}
fn default_status_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Segment length in seconds.
    #[serde(default = "default_segment_length")]
    pub segment_length: u32,
    #[serde(default = "default_frames_per_segment")]
    pub frames_per_segment: u32,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_query_top_k")]
    pub query_top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_length: default_segment_length(),
            frames_per_segment: default_frames_per_segment(),
            chunk_max_tokens: default_chunk_max_tokens(),
            query_top_k: default_query_top_k(),
        }
    }
}

fn default_segment_length() -> u32 {
    30
}
fn default_frames_per_segment() -> u32 {
    4
}
fn default_chunk_max_tokens() -> usize {
    256
}
fn default_query_top_k() -> usize {
    5
}

/// External programs the pipeline shells out to. Each is a command line
/// (program followed by arguments).
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CollaboratorsConfig {
    #[serde(default)]
    pub splitter: Option<Vec<String>>,
    #[serde(default)]
    pub transcriber: Option<Vec<String>>,
    #[serde(default)]
    pub captioner: Option<Vec<String>>,
    #[serde(default)]
    pub embedder: Option<Vec<String>>,
    #[serde(default)]
    pub entity_extractor: Option<Vec<String>>,
    #[serde(default)]
    pub answerer: Option<Vec<String>>,
}

impl Config {
    /// Defaults for everything, storage under `base_path`.
    pub fn minimal(base_path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                base_path: base_path.into(),
            },
            server: ServerConfig::default(),
            encoder: EncoderConfig::default(),
            workers: WorkersConfig::default(),
            client: ClientConfig::default(),
            pipeline: PipelineConfig::default(),
            collaborators: CollaboratorsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.storage.base_path.as_os_str().is_empty() {
        anyhow::bail!("storage.base_path must not be empty");
    }

    if config.workers.name_prefix.is_empty()
        || !config
            .workers
            .name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("workers.name_prefix must be non-empty and use [A-Za-z0-9_-]");
    }

    if config.encoder.batch_size == 0 {
        anyhow::bail!("encoder.batch_size must be > 0");
    }

    if config.pipeline.segment_length == 0 {
        anyhow::bail!("pipeline.segment_length must be > 0");
    }
    if config.pipeline.chunk_max_tokens == 0 {
        anyhow::bail!("pipeline.chunk_max_tokens must be > 0");
    }
    if config.pipeline.query_top_k == 0 {
        anyhow::bail!("pipeline.query_top_k must be >= 1");
    }

    if config.client.encode_timeout_secs == 0 || config.client.status_timeout_secs == 0 {
        anyhow::bail!("client timeouts must be > 0");
    }

    let c = &config.collaborators;
    for (name, cmd) in [
        ("splitter", &c.splitter),
        ("transcriber", &c.transcriber),
        ("captioner", &c.captioner),
        ("embedder", &c.embedder),
        ("entity_extractor", &c.entity_extractor),
        ("answerer", &c.answerer),
    ] {
        if matches!(cmd, Some(argv) if argv.is_empty()) {
            anyhow::bail!("collaborators.{} must name a program", name);
        }
    }

    match config.encoder.backend.as_str() {
        "disabled" | "fastembed" => {}
        other => anyhow::bail!(
            "Unknown encoder backend: '{}'. Must be disabled or fastembed.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("framehub.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[storage]\nbase_path = \"/srv/data\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/srv/data"));
        assert_eq!(config.workers.grace_period_secs, 5);
        assert_eq!(config.workers.kill_timeout_secs, 3);
        assert_eq!(config.client.encode_timeout_secs, 1800);
        assert_eq!(config.client.status_timeout_secs, 30);
        assert_eq!(config.encoder.backend, "disabled");
        assert!(!config.encoder.is_enabled());
        assert!(config.collaborators.splitter.is_none());
    }

    #[test]
    fn test_full_file() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            r#"
[storage]
base_path = "data"

[server]
bind = "0.0.0.0:9000"

[encoder]
backend = "fastembed"
model_path = "clip-vit-b32"

[workers]
name_prefix = "vrag"
grace_period_secs = 1

[pipeline]
query_top_k = 3

[collaborators]
splitter = ["python3", "split.py"]
answerer = ["answer"]
"#,
        );
        let config = load_config(&path).unwrap();
        assert!(config.encoder.is_enabled());
        assert_eq!(config.workers.name_prefix, "vrag");
        assert_eq!(config.pipeline.query_top_k, 3);
        assert_eq!(config.server.encoder_base_url(), "http://127.0.0.1:9000");
        assert_eq!(
            config.collaborators.splitter,
            Some(vec!["python3".to_string(), "split.py".to_string()])
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tmp = TempDir::new().unwrap();
        let bad_backend = write(&tmp, "[storage]\nbase_path = \"d\"\n[encoder]\nbackend = \"magic\"\n");
        assert!(load_config(&bad_backend).is_err());

        let bad_prefix = write(&tmp, "[storage]\nbase_path = \"d\"\n[workers]\nname_prefix = \"a b\"\n");
        assert!(load_config(&bad_prefix).is_err());

        let empty_cmd = write(&tmp, "[storage]\nbase_path = \"d\"\n[collaborators]\nsplitter = []\n");
        assert!(load_config(&empty_cmd).is_err());

        assert!(load_config(&tmp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_public_url_wins() {
        let mut server = ServerConfig::default();
        assert_eq!(server.encoder_base_url(), "http://127.0.0.1:7860");
        server.public_url = Some("http://encoder.internal:80/".into());
        assert_eq!(server.encoder_base_url(), "http://encoder.internal:80");
    }

    #[test]
    fn test_minimal_validates() {
        assert!(validate(&Config::minimal("/tmp/x")).is_ok());
    }
}
