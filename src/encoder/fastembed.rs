//! CLIP ViT-B/32 through fastembed (ONNX Runtime).
//!
//! Image and text towers share one embedding space, so segment keyframes and
//! text queries can be compared directly with cosine similarity.

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use std::path::PathBuf;

use super::{keyframe_path, LoadedModel, ModelBackend};
use crate::error::{Error, Result};

const CLIP_VIT_B32: &str = "clip-vit-b32";

pub struct FastembedBackend {
    batch_size: usize,
}

impl FastembedBackend {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl ModelBackend for FastembedBackend {
    fn name(&self) -> &str {
        "fastembed"
    }

    fn default_model(&self) -> &str {
        CLIP_VIT_B32
    }

    fn load(&self, model_path: &str) -> Result<Box<dyn LoadedModel>> {
        let (image_model, text_model) = match model_path.to_lowercase().as_str() {
            CLIP_VIT_B32 | "clip-vit-b-32" | "qdrant/clip-vit-b-32-vision" => {
                (ImageEmbeddingModel::ClipVitB32, EmbeddingModel::ClipVitB32)
            }
            other => {
                return Err(Error::Configuration(format!(
                    "unknown fastembed encoder model: {}. Supported: {}",
                    other, CLIP_VIT_B32
                )))
            }
        };

        let image = ImageEmbedding::try_new(
            ImageInitOptions::new(image_model).with_show_download_progress(true),
        )
        .map_err(|e| {
            Error::Configuration(format!("failed to initialize image encoder: {}", e))
        })?;
        let text = TextEmbedding::try_new(
            InitOptions::new(text_model).with_show_download_progress(true),
        )
        .map_err(|e| Error::Configuration(format!("failed to initialize text encoder: {}", e)))?;

        Ok(Box::new(ClipModel {
            image,
            text,
            batch_size: self.batch_size,
        }))
    }
}

struct ClipModel {
    image: ImageEmbedding,
    text: TextEmbedding,
    batch_size: usize,
}

impl LoadedModel for ClipModel {
    fn encode_videos(&mut self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        let frames: Vec<PathBuf> = segments.iter().map(|s| keyframe_path(s)).collect();
        if let Some(missing) = frames.iter().find(|f| !f.exists()) {
            return Err(Error::InvalidRequest(format!(
                "keyframe not found: {}",
                missing.display()
            )));
        }
        self.image
            .embed(frames, Some(self.batch_size))
            .map_err(|e| Error::WorkerCrash(format!("image encoding failed: {}", e)))
    }

    fn encode_text(&mut self, text: &str) -> Result<Vec<f32>> {
        let mut out = self
            .text
            .embed(vec![text.to_string()], None)
            .map_err(|e| Error::WorkerCrash(format!("text encoding failed: {}", e)))?;
        out.pop()
            .ok_or_else(|| Error::WorkerCrash("text encoder returned no vector".to_string()))
    }
}
