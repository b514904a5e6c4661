//! Per-session store for intermediate pipeline artifacts.
//!
//! Every stage of the indexing pipeline owns a directory under
//! `intermediates/`, named after the fixed, ordered [`Stage`] list. Stage
//! outputs are written through [`crate::atomic`] so a crash mid-write never
//! leaves a partial file and a failed run stays auditable.
//!
//! # Files per stage
//!
//! | File | Writer |
//! |------|--------|
//! | `<stage>_result.json` | [`ArtifactStore::save_step_result`] |
//! | `<stage>_config.json` | [`ArtifactStore::save_step_config`] |
//! | `<stage>_stats.json` | [`ArtifactStore::save_step_stats`] |
//! | `<stage>_log.json` | [`ArtifactStore::append_log`] |
//! | `*_by_segment/segment_NNN.json` | [`ArtifactStore::save_segment_artifact`] |
//!
//! # Concurrency
//!
//! Log and error-log appends are read-modify-write without a cross-process
//! lock. Two processes appending to the same log at the same moment can lose
//! an entry. Each session has a single indexing worker, so this is accepted.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::atomic::{self, ArtifactContent};
use crate::error::{Error, Result};
use crate::session::SessionPaths;

/// Maximum number of entries kept in `intermediates/error_log.json`.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Age after which an abandoned staging file is considered dead.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(600);

/// One step of the indexing pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Upload,
    Split,
    Transcribe,
    Caption,
    Merge,
    FeatureExtract,
    Chunk,
    EntityExtract,
    Embed,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Upload,
        Stage::Split,
        Stage::Transcribe,
        Stage::Caption,
        Stage::Merge,
        Stage::FeatureExtract,
        Stage::Chunk,
        Stage::EntityExtract,
        Stage::Embed,
        Stage::Index,
    ];

    /// Directory (and file prefix) name of the stage.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Upload => "01_video_upload",
            Stage::Split => "02_video_splitting",
            Stage::Transcribe => "03_asr_transcription",
            Stage::Caption => "04_caption_generation",
            Stage::Merge => "05_data_merging",
            Stage::FeatureExtract => "06_feature_extraction",
            Stage::Chunk => "07_text_chunking",
            Stage::EntityExtract => "08_entity_extraction",
            Stage::Embed => "09_vector_embedding",
            Stage::Index => "10_index_construction",
        }
    }

    /// Human label used in status messages.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Upload => "Upload",
            Stage::Split => "Splitting",
            Stage::Transcribe => "Transcription",
            Stage::Caption => "Captioning",
            Stage::Merge => "Merging",
            Stage::FeatureExtract => "Feature extraction",
            Stage::Chunk => "Chunking",
            Stage::EntityExtract => "Entity extraction",
            Stage::Embed => "Embedding",
            Stage::Index => "Index construction",
        }
    }

    /// Sub-directory and record field for stages that fan out per segment.
    fn segment_layout(self) -> Option<(&'static str, &'static str)> {
        match self {
            Stage::Transcribe => Some(("transcripts_by_segment", "transcript")),
            Stage::Caption => Some(("captions_by_segment", "caption")),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.dir_name() == s)
            .ok_or_else(|| Error::UnknownStage(s.to_string()))
    }
}

impl Serialize for Stage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.dir_name())
    }
}

/// Severity of a stage log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Status of one stage in [`Progress`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageStatus {
    pub stage: Stage,
    pub status: String,
}

/// Coarse progress derived from the stage result files.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub session_id: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub progress_percentage: f64,
    pub current_step: Option<Stage>,
    pub steps_status: Vec<StageStatus>,
}

/// Artifact store for one session.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    paths: SessionPaths,
}

impl ArtifactStore {
    /// Open the store for `session_id` under `base`, creating the full
    /// directory tree. Safe to call repeatedly.
    pub fn open(base: &Path, session_id: &str) -> Result<Self> {
        let store = Self {
            paths: SessionPaths::new(base, session_id),
        };
        store.create_layout()?;
        Ok(store)
    }

    fn create_layout(&self) -> Result<()> {
        let mut dirs = vec![
            self.paths.root.clone(),
            self.paths.intermediates_dir(),
            self.paths.cache_dir(),
            self.paths.vector_db_dir(),
            self.paths.graph_db_dir(),
        ];
        for stage in Stage::ALL {
            let dir = self.stage_dir(stage);
            if let Some((sub, _)) = stage.segment_layout() {
                dirs.push(dir.join(sub));
            }
            dirs.push(dir);
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn session_id(&self) -> &str {
        &self.paths.session_id
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.paths.intermediates_dir().join(stage.dir_name())
    }

    /// Resolve the file for `key`. Keys with an extension are used verbatim;
    /// bare keys become `<stage>_<key>.<ext>`.
    fn key_path(&self, stage: Stage, key: &str, ext: &str) -> PathBuf {
        let name = if key.contains('.') {
            key.to_string()
        } else {
            format!("{}_{}.{}", stage.dir_name(), key, ext)
        };
        self.stage_dir(stage).join(name)
    }

    /// Atomically write one artifact for a stage.
    pub fn write(&self, stage: Stage, key: &str, content: &ArtifactContent) -> Result<PathBuf> {
        let ext = match content {
            ArtifactContent::Record(_) => "json",
            ArtifactContent::Text(_) => "txt",
            ArtifactContent::Binary(_) => "bin",
        };
        let path = self.key_path(stage, key, ext);
        atomic::atomic_write(&path, content)?;
        Ok(path)
    }

    /// Read a JSON artifact. `None` when absent or unreadable.
    pub fn read(&self, stage: Stage, key: &str) -> Option<Value> {
        atomic::read_json(&self.key_path(stage, key, "json"))
    }

    /// Read a binary artifact written with [`ArtifactContent::Binary`].
    pub fn read_binary(&self, stage: Stage, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(stage, key, "bin");
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one entry to the stage's JSON log.
    ///
    /// A missing or corrupt log starts over as empty.
    pub fn append_log(&self, stage: Stage, message: &str, level: LogLevel) -> Result<()> {
        let path = self.key_path(stage, "log", "json");
        let mut entries: Vec<Value> = atomic::read_json_or_default(&path);
        entries.push(json!({
            "timestamp": atomic::now_iso(),
            "level": level.as_str(),
            "message": message,
        }));
        atomic::atomic_write(&path, &ArtifactContent::Record(Value::Array(entries)))
    }

    /// Entries of the stage log, oldest first.
    pub fn read_log(&self, stage: Stage) -> Vec<Value> {
        atomic::read_json_or_default(&self.key_path(stage, "log", "json"))
    }

    /// Mark a stage as started. A crash leaves it visible as `processing`.
    pub fn begin_step(&self, stage: Stage) -> Result<()> {
        let envelope = json!({
            "step": stage.dir_name(),
            "status": "processing",
            "timestamp": atomic::now_iso(),
            "data": {},
        });
        self.write(stage, "result", &ArtifactContent::Record(envelope))?;
        Ok(())
    }

    /// Save the completed result of a stage.
    pub fn save_step_result<T: Serialize + fmt::Debug>(
        &self,
        stage: Stage,
        data: &T,
        metadata: Option<Value>,
    ) -> Result<()> {
        let mut envelope = json!({
            "step": stage.dir_name(),
            "status": "completed",
            "timestamp": atomic::now_iso(),
            "data": atomic::normalize(data),
        });
        if let Some(meta) = metadata {
            envelope["metadata"] = meta;
        }
        self.write(stage, "result", &ArtifactContent::Record(envelope))?;
        tracing::debug!(session = %self.session_id(), "saved result for {}", stage);
        Ok(())
    }

    pub fn save_step_config<T: Serialize + fmt::Debug>(&self, stage: Stage, config: &T) -> Result<()> {
        self.save_envelope(stage, "config", atomic::normalize(config))
    }

    pub fn save_step_stats<T: Serialize + fmt::Debug>(&self, stage: Stage, stats: &T) -> Result<()> {
        self.save_envelope(stage, "stats", atomic::normalize(stats))
    }

    fn save_envelope(&self, stage: Stage, field: &str, data: Value) -> Result<()> {
        let mut envelope = json!({
            "step": stage.dir_name(),
            "timestamp": atomic::now_iso(),
        });
        envelope[field] = data;
        self.write(stage, field, &ArtifactContent::Record(envelope))?;
        Ok(())
    }

    /// Full result envelope of a stage.
    pub fn load_step_result(&self, stage: Stage) -> Option<Value> {
        self.read(stage, "result")
    }

    /// `config` payload of a stage, without the envelope.
    pub fn load_step_config(&self, stage: Stage) -> Option<Value> {
        self.read(stage, "config")?.get("config").cloned()
    }

    /// Write one per-segment artifact (transcription and captioning only).
    ///
    /// Written as each segment finishes so progress is visible while the
    /// stage is still running.
    pub fn save_segment_artifact(&self, stage: Stage, segment: usize, text: &str) -> Result<PathBuf> {
        let (sub, field) = stage
            .segment_layout()
            .ok_or_else(|| Error::UnknownStage(format!("{} has no per-segment artifacts", stage)))?;
        let path = self
            .stage_dir(stage)
            .join(sub)
            .join(format!("segment_{:03}.json", segment));
        let mut record = json!({
            "segment_id": segment.to_string(),
            "timestamp": atomic::now_iso(),
        });
        record[field] = Value::String(text.to_string());
        atomic::atomic_write(&path, &ArtifactContent::Record(record))?;
        Ok(path)
    }

    /// Per-segment texts already on disk for a fan-out stage.
    pub fn load_segment_artifacts(&self, stage: Stage) -> BTreeMap<usize, String> {
        let mut out = BTreeMap::new();
        let Some((sub, field)) = stage.segment_layout() else {
            return out;
        };
        let dir = self.stage_dir(stage).join(sub);
        for entry in WalkDir::new(&dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = atomic::read_json::<Value>(path) else {
                continue;
            };
            let index = record
                .get("segment_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<usize>().ok());
            let text = record.get(field).and_then(Value::as_str);
            if let (Some(index), Some(text)) = (index, text) {
                out.insert(index, text.to_string());
            }
        }
        out
    }

    /// Append to the session-wide error log, keeping the newest
    /// [`ERROR_LOG_CAPACITY`] entries.
    pub fn record_error<T: Serialize + fmt::Debug>(&self, info: &T) -> Result<()> {
        let path = self.error_log_path();
        let mut errors: Vec<Value> = atomic::read_json_or_default(&path);
        errors.push(json!({
            "session_id": self.session_id(),
            "error": atomic::normalize(info),
            "timestamp": atomic::now_iso(),
        }));
        if errors.len() > ERROR_LOG_CAPACITY {
            let excess = errors.len() - ERROR_LOG_CAPACITY;
            errors.drain(..excess);
        }
        atomic::atomic_write(&path, &ArtifactContent::Record(Value::Array(errors)))
    }

    /// Error log entries, oldest first.
    pub fn errors(&self) -> Vec<Value> {
        atomic::read_json_or_default(&self.error_log_path())
    }

    fn error_log_path(&self) -> PathBuf {
        self.paths.intermediates_dir().join("error_log.json")
    }

    pub fn save_processing_summary<T: Serialize + fmt::Debug>(&self, summary: &T) -> Result<()> {
        let data = json!({
            "session_id": self.session_id(),
            "summary": atomic::normalize(summary),
            "generated_at": atomic::now_iso(),
        });
        atomic::atomic_write(
            &self.paths.intermediates_dir().join("processing_summary.json"),
            &ArtifactContent::Record(data),
        )
    }

    /// `not_started` when the stage has no result file, otherwise the
    /// result's `status` field.
    pub fn status(&self, stage: Stage) -> String {
        match self.load_step_result(stage) {
            None => "not_started".to_string(),
            Some(result) => result
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }
    }

    pub fn all_status(&self) -> Vec<StageStatus> {
        Stage::ALL
            .iter()
            .map(|&stage| StageStatus {
                stage,
                status: self.status(stage),
            })
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let steps_status = self.all_status();
        let completed_steps = steps_status.iter().filter(|s| s.status == "completed").count();
        let total_steps = Stage::ALL.len();
        let current_step = steps_status
            .iter()
            .find(|s| s.status == "processing" || s.status == "in_progress")
            .map(|s| s.stage);
        Progress {
            session_id: self.session_id().to_string(),
            total_steps,
            completed_steps,
            progress_percentage: completed_steps as f64 / total_steps as f64 * 100.0,
            current_step,
            steps_status,
        }
    }

    /// Files under one stage (or every stage), relative to the session root.
    pub fn list_files(&self, stage: Option<Stage>) -> BTreeMap<String, Vec<String>> {
        let explicit = stage.is_some();
        let stages: Vec<Stage> = match stage {
            Some(s) => vec![s],
            None => Stage::ALL.to_vec(),
        };
        let mut out = BTreeMap::new();
        for stage in stages {
            let files: Vec<String> = WalkDir::new(self.stage_dir(stage))
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(&self.paths.root)
                        .ok()
                        .map(|p| p.to_string_lossy().into_owned())
                })
                .collect();
            if explicit || !files.is_empty() {
                out.insert(stage.dir_name().to_string(), files);
            }
        }
        out
    }

    /// Remove staging files left behind by an interrupted write.
    ///
    /// Only files untouched for [`STALE_TEMP_AGE`] are removed, so staging
    /// files of writes still in flight in other processes survive.
    pub fn cleanup_temp_files(&self) -> usize {
        self.cleanup_temp_files_older_than(STALE_TEMP_AGE)
    }

    pub fn cleanup_temp_files_older_than(&self, age: Duration) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.paths.root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(atomic::TEMP_SUFFIX));
            if !entry.file_type().is_file() || !is_temp {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|elapsed| elapsed >= age);
            if !stale {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!("removed stale temp file {}", path.display());
                }
                Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}
