//! Pipeline progress reporting.
//!
//! The pipelines emit [`ProgressEvent`]s; a [`ProgressReporter`] decides
//! where they go. Inside a worker the reporter is [`StatusProgress`], which
//! writes `message` / `current_step` into the session's status document so
//! the orchestrator (and the UI behind it) can follow along. Tests use
//! [`NoProgress`].

use serde_json::json;
use std::sync::Arc;

use crate::artifacts::Stage;
use crate::status::{Namespace, StatusStore};

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Starting video `index` (1-based) of `total`.
    VideoStarted {
        index: usize,
        total: usize,
        video: String,
    },
    StageStarted {
        video: String,
        stage: Stage,
    },
    /// Per-segment fan-out inside a stage.
    SegmentDone {
        video: String,
        stage: Stage,
        done: usize,
        total: usize,
    },
    VideoFinished {
        index: usize,
        total: usize,
        video: String,
    },
    /// A step of a query job.
    QueryStep {
        step: String,
        message: String,
    },
}

impl ProgressEvent {
    /// `(current_step, message)` as written into the status document.
    pub fn describe(&self) -> (String, String) {
        match self {
            ProgressEvent::VideoStarted { index, total, video } => (
                "Processing".to_string(),
                format!("Processing video {}/{}: {}", index, total, video),
            ),
            ProgressEvent::StageStarted { video, stage } => {
                (stage.label().to_string(), format!("{}: {}", stage.label(), video))
            }
            ProgressEvent::SegmentDone {
                video,
                stage,
                done,
                total,
            } => (
                stage.label().to_string(),
                format!("{}: {} ({}/{} segments)", stage.label(), video, done, total),
            ),
            ProgressEvent::VideoFinished { index, total, video } => (
                "Indexed".to_string(),
                format!("Finished video {}/{}: {}", index, total, video),
            ),
            ProgressEvent::QueryStep { step, message } => (step.clone(), message.clone()),
        }
    }

    fn namespace(&self) -> Namespace {
        match self {
            ProgressEvent::QueryStep { .. } => Namespace::Query,
            _ => Namespace::Indexing,
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Writes progress into the session's status document.
///
/// A failed write is logged and otherwise ignored: progress must never fail
/// the job it describes.
pub struct StatusProgress {
    store: Arc<StatusStore>,
    session_id: String,
}

impl StatusProgress {
    pub fn new(store: Arc<StatusStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }
}

impl ProgressReporter for StatusProgress {
    fn report(&self, event: ProgressEvent) {
        let (step, message) = event.describe();
        let mut partial = json!({ "current_step": step, "message": message });
        if let ProgressEvent::VideoStarted { video, .. } = &event {
            partial["current_video"] = json!(video);
        }
        if let Err(e) = self.store.update(&self.session_id, event.namespace(), partial) {
            tracing::warn!(session = %self.session_id, "failed to record progress: {}", e);
        }
    }
}

/// No-op reporter.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_describe() {
        let (step, msg) = ProgressEvent::SegmentDone {
            video: "a.mp4".into(),
            stage: Stage::Transcribe,
            done: 3,
            total: 10,
        }
        .describe();
        assert_eq!(step, Stage::Transcribe.label());
        assert!(msg.ends_with("(3/10 segments)"));
    }

    #[test]
    fn test_status_progress_writes_namespace() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StatusStore::new(tmp.path()));
        store.begin_indexing("s1", 2).unwrap();
        let reporter = StatusProgress::new(store.clone(), "s1");

        reporter.report(ProgressEvent::VideoStarted {
            index: 1,
            total: 2,
            video: "a.mp4".into(),
        });
        reporter.report(ProgressEvent::QueryStep {
            step: "Searching".into(),
            message: "Searching 4 segments".into(),
        });

        let doc = store.document("s1");
        let idx = doc.indexing_status.unwrap();
        assert_eq!(idx.message.as_deref(), Some("Processing video 1/2: a.mp4"));
        assert_eq!(idx.total_videos, Some(2));
        assert_eq!(idx.extra["current_video"], "a.mp4");
        assert_eq!(doc.query_status.unwrap().current_step.as_deref(), Some("Searching"));
    }
}
