//! Crash-safe per-session status documents.
//!
//! `chat-{id}/status.json` is the only channel between the orchestrator and
//! its worker processes. Both sides re-read it rather than sharing memory, and
//! every write goes through [`crate::atomic::atomic_write`], so the document
//! on disk is always complete even when a worker is killed mid-update.
//!
//! # Document shape
//!
//! ```json
//! {
//!   "indexing_status": { "status": "processing", "message": "...", "current_step": "...",
//!                        "total_videos": 2, "processed_videos": 1 },
//!   "query_status":    { "status": "completed", "message": "...", "current_step": "...",
//!                        "query": "...", "answer": "..." },
//!   "indexed_videos": ["/videos/a.mp4"],
//!   "created_at": 1718000000.5,
//!   "last_updated": 1718000042.1
//! }
//! ```
//!
//! # Consistency
//!
//! [`StatusStore::update`] is a read-modify-write with no cross-process lock.
//! Two processes updating the same namespace at once can lose one update
//! (last writer wins for the whole file). Exactly one worker owns a namespace
//! at a time, which keeps this safe in practice.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::atomic::{self, ArtifactContent};
use crate::error::{Error, Result};
use crate::session::SessionPaths;

/// Lifecycle state of one job namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Processing,
    Completed,
    Error,
    Terminated,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Error => "error",
            JobState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Processing)
    }

    /// `processing` may move to anything (including itself, for progress
    /// updates). Terminal states are final within a job.
    pub fn can_transition_to(self, _next: JobState) -> bool {
        matches!(self, JobState::Processing)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level namespace of the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Indexing,
    Query,
}

impl Namespace {
    pub fn key(self) -> &'static str {
        match self {
            Namespace::Indexing => "indexing_status",
            Namespace::Query => "query_status",
        }
    }
}

/// Typed view of `indexing_status`. Unknown fields survive in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexingStatus {
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub total_videos: Option<usize>,
    #[serde(default)]
    pub processed_videos: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of `query_status`. Unknown fields survive in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryStatus {
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of the whole document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_status: Option<IndexingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_status: Option<QueryStatus>,
    #[serde(default)]
    pub indexed_videos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusDocument {
    /// Interpret a raw document. A shape that does not fit the typed view is
    /// treated like a corrupt file: empty.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("status document does not match schema: {}", e);
                StatusDocument::default()
            }
        }
    }
}

/// Reads and writes status documents under the storage root.
#[derive(Debug, Clone)]
pub struct StatusStore {
    base: PathBuf,
}

impl StatusStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn session_paths(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(&self.base, session_id)
    }

    /// Path of the session's status file. Creates the session directory.
    pub fn status_path(&self, session_id: &str) -> Result<PathBuf> {
        let paths = self.session_paths(session_id);
        paths.ensure_root()?;
        Ok(paths.status_file())
    }

    /// Read a status document. Missing, corrupt or non-object files all
    /// yield an empty object.
    pub fn read(&self, path: &Path) -> Value {
        match atomic::read_json::<Value>(path) {
            Some(v @ Value::Object(_)) => v,
            Some(_) => {
                tracing::warn!("status file {} is not a JSON object", path.display());
                Value::Object(Map::new())
            }
            None => Value::Object(Map::new()),
        }
    }

    /// Atomically replace a status document.
    pub fn write(&self, path: &Path, document: &Value) -> Result<()> {
        atomic::atomic_write(path, &ArtifactContent::Record(document.clone()))
    }

    /// Typed document for a session (empty if absent).
    pub fn document(&self, session_id: &str) -> StatusDocument {
        let path = self.session_paths(session_id).status_file();
        StatusDocument::from_value(self.read(&path))
    }

    /// Shallow-merge `partial` into `document[namespace]`, stamp
    /// `last_updated`, write back. Returns the merged document.
    pub fn update(&self, session_id: &str, namespace: Namespace, partial: Value) -> Result<Value> {
        let path = self.status_path(session_id)?;
        let mut doc = self.read(&path);
        merge_namespace(&mut doc, namespace, partial);
        self.write(&path, &doc)?;
        tracing::debug!(session = session_id, "updated {}", namespace.key());
        Ok(doc)
    }

    /// Like [`update`](Self::update), but validates the job state machine:
    /// once a namespace is terminal, only a new `begin_*` can reopen it.
    pub fn transition(
        &self,
        session_id: &str,
        namespace: Namespace,
        state: JobState,
        partial: Value,
    ) -> Result<Value> {
        let path = self.status_path(session_id)?;
        let mut doc = self.read(&path);
        let current = doc
            .get(namespace.key())
            .and_then(|ns| ns.get("status"))
            .and_then(|s| serde_json::from_value::<JobState>(s.clone()).ok());
        if let Some(current) = current {
            if !current.can_transition_to(state) {
                return Err(Error::InvalidTransition {
                    namespace: namespace.key().to_string(),
                    from: current.to_string(),
                    to: state.to_string(),
                });
            }
        }
        let mut partial = into_object(partial);
        partial.insert("status".into(), Value::String(state.as_str().into()));
        merge_namespace(&mut doc, namespace, Value::Object(partial));
        self.write(&path, &doc)?;
        Ok(doc)
    }

    /// Write the initial document of an indexing job.
    ///
    /// `indexing_status` and `indexed_videos` start over. A concurrent
    /// query job's `query_status` is preserved.
    pub fn begin_indexing(&self, session_id: &str, total_videos: usize) -> Result<()> {
        let path = self.status_path(session_id)?;
        let previous = self.read(&path);
        let now = atomic::now_epoch_secs();
        let mut doc = json!({
            "indexing_status": {
                "status": JobState::Processing,
                "message": "Initializing indexing job...",
                "current_step": "Initializing",
                "total_videos": total_videos,
                "processed_videos": 0,
            },
            "indexed_videos": [],
            "created_at": previous.get("created_at").cloned().unwrap_or(json!(now)),
            "last_updated": now,
        });
        if let Some(query) = previous.get(Namespace::Query.key()) {
            doc[Namespace::Query.key()] = query.clone();
        }
        self.write(&path, &doc)
    }

    /// Reset `query_status` for a new query job.
    pub fn begin_query(&self, session_id: &str, query: &str) -> Result<()> {
        self.update(
            session_id,
            Namespace::Query,
            json!({
                "status": JobState::Processing,
                "message": "Starting query processing...",
                "current_step": "Initializing",
                "query": query,
                "answer": null,
                "started_at": atomic::now_epoch_secs(),
            }),
        )?;
        Ok(())
    }

    /// Record a finished video: append to `indexed_videos` and bump
    /// `indexing_status.processed_videos`.
    pub fn add_indexed_video(&self, session_id: &str, video_path: &str) -> Result<()> {
        let path = self.status_path(session_id)?;
        let mut doc = self.read(&path);
        let Some(obj) = doc.as_object_mut() else {
            return Err(Error::Configuration(format!(
                "status document at {} is not an object",
                path.display()
            )));
        };
        let videos = obj
            .entry("indexed_videos")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !videos.is_array() {
            *videos = Value::Array(Vec::new());
        }
        if let Some(list) = videos.as_array_mut() {
            list.push(Value::String(video_path.to_string()));
        }
        let count = obj["indexed_videos"].as_array().map(Vec::len).unwrap_or(0);
        merge_namespace(&mut doc, Namespace::Indexing, json!({ "processed_videos": count }));
        self.write(&path, &doc)
    }

    /// Force `terminated`, whatever the current state. Used after the
    /// process manager killed a worker.
    pub fn mark_terminated(&self, session_id: &str, namespace: Namespace) -> Result<()> {
        self.update(
            session_id,
            namespace,
            json!({
                "status": JobState::Terminated,
                "message": "Process terminated by user",
                "current_step": "Terminated",
            }),
        )?;
        Ok(())
    }

    pub fn indexing_status(&self, session_id: &str) -> Option<IndexingStatus> {
        self.document(session_id).indexing_status
    }

    pub fn query_status(&self, session_id: &str) -> Option<QueryStatus> {
        self.document(session_id).query_status
    }

    pub fn indexed_videos(&self, session_id: &str) -> Vec<String> {
        self.document(session_id).indexed_videos
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

fn merge_namespace(doc: &mut Value, namespace: Namespace, partial: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    let slot = obj
        .entry(namespace.key())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Some(target) = slot.as_object_mut() {
        for (k, v) in into_object(partial) {
            target.insert(k, v);
        }
    }
    obj.insert("last_updated".into(), json!(atomic::now_epoch_secs()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, StatusStore) {
        let tmp = TempDir::new().unwrap();
        let store = StatusStore::new(tmp.path());
        (tmp, store)
    }

    #[test]
    fn test_status_path_creates_session_dir() {
        let (tmp, store) = store();
        let path = store.status_path("abc").unwrap();
        assert_eq!(path, tmp.path().join("chat-abc").join("status.json"));
        assert!(tmp.path().join("chat-abc").is_dir());
    }

    #[test]
    fn test_read_missing_or_corrupt_is_empty() {
        let (_tmp, store) = store();
        let path = store.status_path("s").unwrap();
        assert_eq!(store.read(&path), json!({}));
        std::fs::write(&path, "{\"indexing_status\": ").unwrap();
        assert_eq!(store.read(&path), json!({}));
        std::fs::write(&path, "[1, 2]").unwrap();
        assert_eq!(store.read(&path), json!({}));
    }

    #[test]
    fn test_update_merges_fields() {
        let (_tmp, store) = store();
        store
            .update("s1", Namespace::Indexing, json!({"status": "processing"}))
            .unwrap();
        store
            .update("s1", Namespace::Indexing, json!({"message": "x"}))
            .unwrap();

        let path = store.status_path("s1").unwrap();
        let doc = store.read(&path);
        assert_eq!(doc["indexing_status"]["status"], "processing");
        assert_eq!(doc["indexing_status"]["message"], "x");
        assert!(doc["last_updated"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_namespaces_are_independent() {
        let (_tmp, store) = store();
        store
            .update("s1", Namespace::Indexing, json!({"status": "processing"}))
            .unwrap();
        store.begin_query("s1", "what happens?").unwrap();

        let doc = store.document("s1");
        assert_eq!(doc.indexing_status.unwrap().status, Some(JobState::Processing));
        let q = doc.query_status.unwrap();
        assert_eq!(q.query.as_deref(), Some("what happens?"));
        assert_eq!(q.answer, None);
        assert!(q.extra.contains_key("started_at"));
    }

    #[test]
    fn test_concurrent_writers_on_both_namespaces() {
        let (_tmp, store) = store();
        let store = std::sync::Arc::new(store);
        let path = store.status_path("s1").unwrap();

        let writers: Vec<_> = [Namespace::Indexing, Namespace::Query]
            .into_iter()
            .map(|ns| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|i| store.update("s1", ns, json!({ "message": i })).is_err())
                        .count()
                })
            })
            .collect();
        let failures: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(failures, 0);
        let doc = store.read(&path);
        assert!(doc.is_object());
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[test]
    fn test_begin_indexing_preserves_query_status() {
        let (_tmp, store) = store();
        store.begin_query("s1", "q").unwrap();
        store.add_indexed_video("s1", "/old.mp4").unwrap();
        store.begin_indexing("s1", 3).unwrap();

        let doc = store.document("s1");
        let idx = doc.indexing_status.unwrap();
        assert_eq!(idx.total_videos, Some(3));
        assert_eq!(idx.processed_videos, Some(0));
        assert!(doc.indexed_videos.is_empty());
        assert!(doc.query_status.is_some());
        assert!(doc.created_at.is_some());
    }

    #[test]
    fn test_indexing_scenario() {
        let (_tmp, store) = store();
        store.begin_indexing("s1", 2).unwrap();
        let idx = store.indexing_status("s1").unwrap();
        assert_eq!(idx.status, Some(JobState::Processing));
        assert_eq!(idx.total_videos, Some(2));

        store.add_indexed_video("s1", "/v/a.mp4").unwrap();
        store.add_indexed_video("s1", "/v/b.mp4").unwrap();
        store
            .transition("s1", Namespace::Indexing, JobState::Completed, json!({"message": "done"}))
            .unwrap();

        let doc = store.document("s1");
        assert_eq!(doc.indexed_videos, vec!["/v/a.mp4", "/v/b.mp4"]);
        let idx = doc.indexing_status.unwrap();
        assert_eq!(idx.status, Some(JobState::Completed));
        assert_eq!(idx.processed_videos, Some(2));
    }

    #[test]
    fn test_terminal_state_rejects_transition() {
        let (_tmp, store) = store();
        store.begin_indexing("s1", 1).unwrap();
        store.mark_terminated("s1", Namespace::Indexing).unwrap();

        let err = store
            .transition("s1", Namespace::Indexing, JobState::Completed, json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            store.indexing_status("s1").unwrap().status,
            Some(JobState::Terminated)
        );

        // A new job reopens the namespace.
        store.begin_indexing("s1", 1).unwrap();
        store
            .transition("s1", Namespace::Indexing, JobState::Error, json!({"message": "bad"}))
            .unwrap();
    }

    #[test]
    fn test_extra_fields_pass_through() {
        let (_tmp, store) = store();
        store
            .update("s1", Namespace::Indexing, json!({"status": "processing", "stage_detail": {"n": 4}}))
            .unwrap();
        let idx = store.indexing_status("s1").unwrap();
        assert_eq!(idx.extra.get("stage_detail"), Some(&json!({"n": 4})));

        let round = serde_json::to_value(&idx).unwrap();
        assert_eq!(round["stage_detail"]["n"], 4);
    }

    #[test]
    fn test_state_machine() {
        assert!(JobState::Processing.can_transition_to(JobState::Completed));
        assert!(JobState::Processing.can_transition_to(JobState::Processing));
        assert!(!JobState::Completed.can_transition_to(JobState::Processing));
        assert!(!JobState::Error.can_transition_to(JobState::Terminated));
        assert!(JobState::Terminated.is_terminal());
    }
}
