//! External collaborators of the indexing and query pipelines.
//!
//! Splitting, transcription, captioning, text embedding, entity extraction
//! and answering are done by other programs. The pipelines only see the
//! [`Collaborators`] trait; [`CommandCollaborators`] implements it by running
//! the command lines from `[collaborators]`, writing one JSON request to
//! stdin and reading one JSON response from stdout.
//!
//! | Command | Request | Response |
//! |---------|---------|----------|
//! | `splitter` | `{video_path, segment_length, frames_per_segment, output_dir}` | `{segments: {"0": "segment_000.mp4"}, timings: {"0": {start, end}}}` |
//! | `transcriber` | `{segments: {"0": "/abs/segment_000.mp4"}}` | `{transcripts: {"0": "..."}}` |
//! | `captioner` | `{segments: {"0": {video_path, transcript}}}` | `{captions: {"0": "..."}}` |
//! | `embedder` | `{texts: [...]}` | `{embeddings: [[...]]}` |
//! | `entity_extractor` | `{texts: [...]}` | `{entities: [{name, label, chunks}]}` |
//! | `answerer` | `{query, context: [...]}` | `{answer: "..."}` |
//!
//! A non-zero exit status is an [`Error::Collaborator`] carrying stderr.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::CollaboratorsConfig;
use crate::error::{Error, Result};
use crate::vector_store::RetrievedSegment;

#[derive(Debug, Clone, Serialize)]
pub struct SplitRequest<'a> {
    pub video_path: &'a Path,
    pub segment_length: u32,
    pub frames_per_segment: u32,
    pub output_dir: &'a Path,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentTiming {
    pub start: f64,
    pub end: f64,
}

/// Splitter output: segment file names (relative to `output_dir`) and timings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SplitOutput {
    pub segments: BTreeMap<usize, String>,
    #[serde(default)]
    pub timings: BTreeMap<usize, SegmentTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptionInput {
    pub video_path: PathBuf,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub label: String,
    /// Indices into the texts passed to `extract_entities`.
    #[serde(default)]
    pub chunks: Vec<usize>,
}

pub trait Collaborators: Send + Sync {
    fn split(&self, request: &SplitRequest<'_>) -> Result<SplitOutput>;

    fn transcribe(&self, segments: &BTreeMap<usize, PathBuf>) -> Result<BTreeMap<usize, String>>;

    fn caption(&self, segments: &BTreeMap<usize, CaptionInput>) -> Result<BTreeMap<usize, String>>;

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn extract_entities(&self, _texts: &[String]) -> Result<Vec<Entity>> {
        Ok(Vec::new())
    }

    /// `None` when no answerer is available.
    fn answer(&self, _query: &str, _context: &[RetrievedSegment]) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Runs the configured command lines.
pub struct CommandCollaborators {
    config: CollaboratorsConfig,
}

impl CommandCollaborators {
    pub fn new(config: CollaboratorsConfig) -> Self {
        Self { config }
    }

    fn call<T: DeserializeOwned>(
        &self,
        name: &str,
        argv: Option<&Vec<String>>,
        request: &Value,
        field: &str,
    ) -> Result<T> {
        let argv = argv.ok_or_else(|| {
            Error::Configuration(format!("collaborators.{} is not configured", name))
        })?;
        let mut response = run_json_command(name, argv, request)?;
        let value = response
            .get_mut(field)
            .map(Value::take)
            .ok_or_else(|| collab_error(name, format!("response has no '{}' field", field)))?;
        serde_json::from_value(value)
            .map_err(|e| collab_error(name, format!("unexpected '{}' shape: {}", field, e)))
    }
}

impl Collaborators for CommandCollaborators {
    fn split(&self, request: &SplitRequest<'_>) -> Result<SplitOutput> {
        let argv = self.config.splitter.as_ref().ok_or_else(|| {
            Error::Configuration("collaborators.splitter is not configured".to_string())
        })?;
        let response = run_json_command("splitter", argv, &serde_json::to_value(request)?)?;
        serde_json::from_value(response)
            .map_err(|e| collab_error("splitter", format!("unexpected response: {}", e)))
    }

    fn transcribe(&self, segments: &BTreeMap<usize, PathBuf>) -> Result<BTreeMap<usize, String>> {
        self.call(
            "transcriber",
            self.config.transcriber.as_ref(),
            &json!({ "segments": segments }),
            "transcripts",
        )
    }

    fn caption(&self, segments: &BTreeMap<usize, CaptionInput>) -> Result<BTreeMap<usize, String>> {
        self.call(
            "captioner",
            self.config.captioner.as_ref(),
            &json!({ "segments": segments }),
            "captions",
        )
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors: Vec<Vec<f32>> = self.call(
            "embedder",
            self.config.embedder.as_ref(),
            &json!({ "texts": texts }),
            "embeddings",
        )?;
        if vectors.len() != texts.len() {
            return Err(collab_error(
                "embedder",
                format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        Ok(vectors)
    }

    fn extract_entities(&self, texts: &[String]) -> Result<Vec<Entity>> {
        if self.config.entity_extractor.is_none() || texts.is_empty() {
            return Ok(Vec::new());
        }
        self.call(
            "entity_extractor",
            self.config.entity_extractor.as_ref(),
            &json!({ "texts": texts }),
            "entities",
        )
    }

    fn answer(&self, query: &str, context: &[RetrievedSegment]) -> Result<Option<String>> {
        if self.config.answerer.is_none() {
            return Ok(None);
        }
        let answer: String = self.call(
            "answerer",
            self.config.answerer.as_ref(),
            &json!({ "query": query, "context": context }),
            "answer",
        )?;
        Ok(Some(answer))
    }
}

fn collab_error(name: &str, message: impl Into<String>) -> Error {
    Error::Collaborator {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Run `argv`, feed `request` on stdin, parse stdout as JSON.
fn run_json_command(name: &str, argv: &[String], request: &Value) -> Result<Value> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Configuration(format!("collaborators.{} is empty", name)))?;
    let payload = serde_json::to_vec(request)?;

    tracing::debug!("running {} collaborator: {}", name, program);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| collab_error(name, format!("failed to start '{}': {}", program, e)))?;

    // Written from a thread so a chatty child cannot deadlock on a full pipe.
    let writer = child.stdin.take().map(|mut stdin| {
        std::thread::spawn(move || {
            let _ = stdin.write_all(&payload);
        })
    });
    let output = child.wait_with_output()?;
    if let Some(handle) = writer {
        let _ = handle.join();
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!("exited with {}: {}", output.status, stderr)
        };
        return Err(collab_error(name, message));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| collab_error(name, format!("stdout is not JSON: {}", e)))
}
