//! Shared video/text encoder.
//!
//! One [`SharedEncoder`] lives inside the orchestrator and owns the single
//! loaded model. Worker processes never load the model themselves; they call
//! the HTTP surface in [`crate::server`] through [`crate::client`].
//!
//! # State machine
//!
//! ```text
//! UNINITIALIZED --initialize(path)--> CONFIGURED --ensure_loaded()--> LOADED
//!                                         ^                              |
//!                                         +----------release()-----------+
//! ```
//!
//! [`SharedEncoder::cleanup`] returns to UNINITIALIZED from anywhere. Every
//! transition and every encode runs under one mutex, so at most one model is
//! resident and encodes are serialized.
//!
//! # Backends
//!
//! The model sits behind [`ModelBackend`]. [`create_backend`] picks one from
//! `[encoder].backend`:
//!
//! | Config Value | Backend |
//! |-------------|---------|
//! | `"disabled"` | [`DisabledBackend`], refuses to load |
//! | `"fastembed"` | CLIP ViT-B/32 via fastembed (`--features fastembed-backend`) |
//!
//! # Vector blobs
//!
//! Matrices travel as `u32 LE rows | u32 LE dims | rows*dims f32 LE`,
//! base64-encoded inside JSON ([`matrix_to_base64`] / [`matrix_from_base64`]).
//! The same bytes are written to `*_embeddings.bin` artifacts.

#[cfg(feature = "fastembed-backend")]
mod fastembed;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::EncoderConfig;
use crate::error::{Error, Result};

/// A model instance that is resident in memory.
pub trait LoadedModel: Send {
    /// One vector per segment, in input order.
    fn encode_videos(&mut self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>>;
    fn encode_text(&mut self, text: &str) -> Result<Vec<f32>>;
}

/// Factory for [`LoadedModel`]s.
pub trait ModelBackend: Send + Sync {
    /// Backend identifier reported by the status endpoint.
    fn name(&self) -> &str;
    /// Model used when `initialize` receives no path.
    fn default_model(&self) -> &str;
    /// Load the model. Expensive; called at most once per LOADED period.
    fn load(&self, model_path: &str) -> Result<Box<dyn LoadedModel>>;
}

/// Anything that can turn segments and queries into vectors: the in-process
/// [`SharedEncoder`] or the HTTP [`crate::client::EncoderClient`].
pub trait VectorEncoder {
    fn encode_video_segments(&self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>>;
    fn encode_string_query(&self, query: &str) -> Result<Vec<f32>>;
}

/// Backend used when no encoder is configured.
pub struct DisabledBackend;

impl ModelBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    fn default_model(&self) -> &str {
        "none"
    }

    fn load(&self, _model_path: &str) -> Result<Box<dyn LoadedModel>> {
        Err(Error::Configuration(
            "encoder backend is disabled; set [encoder].backend".to_string(),
        ))
    }
}

/// Create the backend named in the config.
pub fn create_backend(config: &EncoderConfig) -> Result<Arc<dyn ModelBackend>> {
    match config.backend.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        #[cfg(feature = "fastembed-backend")]
        "fastembed" => Ok(Arc::new(fastembed::FastembedBackend::new(config.batch_size))),
        #[cfg(not(feature = "fastembed-backend"))]
        "fastembed" => Err(Error::Configuration(
            "encoder backend 'fastembed' requires --features fastembed-backend".to_string(),
        )),
        other => Err(Error::Configuration(format!(
            "unknown encoder backend: {}",
            other
        ))),
    }
}

/// Snapshot returned by `GET /api/encoder/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderStatus {
    pub initialized: bool,
    pub loaded: bool,
    pub usage_count: u64,
    pub model_path: Option<String>,
    pub backend: String,
}

#[derive(Default)]
struct EncoderState {
    model_path: Option<String>,
    model: Option<Box<dyn LoadedModel>>,
    usage_count: u64,
}

/// The orchestrator's single encoder instance.
pub struct SharedEncoder {
    backend: Arc<dyn ModelBackend>,
    state: Mutex<EncoderState>,
}

impl SharedEncoder {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(EncoderState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EncoderState> {
        // A panic inside a backend leaves the state itself consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> EncoderStatus {
        let state = self.lock();
        EncoderStatus {
            initialized: state.model_path.is_some(),
            loaded: state.model.is_some(),
            usage_count: state.usage_count,
            model_path: state.model_path.clone(),
            backend: self.backend.name().to_string(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().model.is_some()
    }

    /// Record which model to load. Does not load it.
    ///
    /// Re-initializing with a different path drops a loaded model.
    pub fn initialize(&self, model_path: Option<&str>) {
        let path = model_path
            .unwrap_or_else(|| self.backend.default_model())
            .to_string();
        let mut state = self.lock();
        if state.model.is_some() && state.model_path.as_deref() != Some(path.as_str()) {
            tracing::info!("encoder model path changed, releasing loaded model");
            state.model = None;
        }
        state.model_path = Some(path);
    }

    /// Load the configured model if it is not resident yet.
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut state = self.lock();
        if state.model.is_some() {
            return Ok(());
        }
        let Some(path) = state.model_path.clone() else {
            return Err(Error::Configuration(
                "encoder is not initialized with a model path".to_string(),
            ));
        };
        tracing::info!(backend = self.backend.name(), "loading encoder model {}", path);
        let started = std::time::Instant::now();
        state.model = Some(self.backend.load(&path)?);
        tracing::info!("encoder model loaded in {:.1}s", started.elapsed().as_secs_f32());
        Ok(())
    }

    /// Drop the resident model. No-op when nothing is loaded.
    pub fn release(&self) {
        let mut state = self.lock();
        if state.model.take().is_some() {
            tracing::info!("encoder model released");
        }
    }

    /// Drop the model and forget the configuration.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.model = None;
        state.model_path = None;
    }

    /// Encode a batch of video segments into one vector each.
    pub fn encode_video_segments(&self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        if segments.is_empty() {
            return Err(Error::InvalidRequest("video batch is empty".to_string()));
        }
        if let Some(missing) = segments.iter().find(|p| !p.exists()) {
            return Err(Error::InvalidRequest(format!(
                "video segment not found: {}",
                missing.display()
            )));
        }

        let mut state = self.lock();
        state.usage_count += 1;
        let model = state.model.as_mut().ok_or_else(not_loaded)?;
        let vectors = model.encode_videos(segments)?;
        if vectors.len() != segments.len() {
            return Err(Error::Blob(format!(
                "model returned {} vectors for {} segments",
                vectors.len(),
                segments.len()
            )));
        }
        Ok(vectors)
    }

    /// Encode a text query into one vector.
    pub fn encode_string_query(&self, query: &str) -> Result<Vec<f32>> {
        if query.trim().is_empty() {
            return Err(Error::InvalidRequest("query is empty".to_string()));
        }
        let mut state = self.lock();
        state.usage_count += 1;
        let model = state.model.as_mut().ok_or_else(not_loaded)?;
        model.encode_text(query)
    }
}

impl VectorEncoder for SharedEncoder {
    fn encode_video_segments(&self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        SharedEncoder::encode_video_segments(self, segments)
    }

    fn encode_string_query(&self, query: &str) -> Result<Vec<f32>> {
        SharedEncoder::encode_string_query(self, query)
    }
}

fn not_loaded() -> Error {
    Error::ResourceNotReady("encoder model is not loaded; call load first".to_string())
}

// ============ Vector utilities ============

/// Encode an `f32` slice as little-endian bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian bytes into `f32`s. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Shape-prefixed matrix blob. All rows must have the same width.
pub fn encode_matrix(rows: &[Vec<f32>]) -> Result<Vec<u8>> {
    let dims = rows.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = rows.iter().position(|r| r.len() != dims) {
        return Err(Error::Blob(format!(
            "row {} has {} values, expected {}",
            bad,
            rows[bad].len(),
            dims
        )));
    }
    let mut bytes = Vec::with_capacity(8 + rows.len() * dims * 4);
    bytes.extend_from_slice(&header_field(rows.len(), "row count")?.to_le_bytes());
    bytes.extend_from_slice(&header_field(dims, "dimension")?.to_le_bytes());
    for row in rows {
        bytes.extend_from_slice(&vec_to_blob(row));
    }
    Ok(bytes)
}

fn header_field(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Blob(format!("{} {} does not fit the u32 header", what, value)))
}

/// Inverse of [`encode_matrix`]. Rejects truncated or oversized payloads.
pub fn decode_matrix(bytes: &[u8]) -> Result<Vec<Vec<f32>>> {
    if bytes.len() < 8 {
        return Err(Error::Blob(format!("header needs 8 bytes, got {}", bytes.len())));
    }
    let rows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dims = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let body = &bytes[8..];
    let expected = rows
        .checked_mul(dims)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| Error::Blob(format!("shape {}x{} overflows", rows, dims)))?;
    if body.len() != expected {
        return Err(Error::Blob(format!(
            "shape {}x{} needs {} bytes, got {}",
            rows,
            dims,
            expected,
            body.len()
        )));
    }
    if dims == 0 {
        return Ok(vec![Vec::new(); rows]);
    }
    Ok(body.chunks_exact(dims * 4).map(blob_to_vec).collect())
}

pub fn matrix_to_base64(rows: &[Vec<f32>]) -> Result<String> {
    Ok(STANDARD.encode(encode_matrix(rows)?))
}

pub fn matrix_from_base64(encoded: &str) -> Result<Vec<Vec<f32>>> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Blob(format!("invalid base64: {}", e)))?;
    decode_matrix(&bytes)
}

/// Cosine similarity; `0.0` for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Keyframe image the splitter writes next to a segment (`seg.mp4` -> `seg.jpg`).
pub fn keyframe_path(segment: &Path) -> PathBuf {
    segment.with_extension("jpg")
}
