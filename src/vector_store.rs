//! Final per-session indexes.
//!
//! `final_outputs/vector_db/segments.json` holds one [`SegmentRecord`] per
//! indexed segment, carrying both the video-space vector (from the shared
//! encoder) and the text-space vector (mean of the segment's chunk
//! embeddings). `final_outputs/graph_db/entities.json` holds extracted
//! entities. Both are rewritten atomically after each video.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::atomic;
use crate::encoder::cosine_similarity;
use crate::error::Result;
use crate::session::SessionPaths;

const SEGMENTS_FILE: &str = "segments.json";
const ENTITIES_FILE: &str = "entities.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub id: String,
    pub video_path: String,
    pub segment_index: usize,
    pub start: f64,
    pub end: f64,
    pub transcript: String,
    pub caption: String,
    /// Merged transcript and caption, as shown to the answerer.
    pub text: String,
    pub video_embedding: Vec<f32>,
    #[serde(default)]
    pub text_embedding: Vec<f32>,
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedSegment {
    pub id: String,
    pub video_path: String,
    pub segment_index: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStore {
    pub segments: Vec<SegmentRecord>,
}

impl VectorStore {
    fn path(paths: &SessionPaths) -> PathBuf {
        paths.vector_db_dir().join(SEGMENTS_FILE)
    }

    /// Load the session's store. Missing or corrupt files load as empty.
    pub fn load(paths: &SessionPaths) -> Self {
        atomic::read_json_or_default(&Self::path(paths))
    }

    pub fn save(&self, paths: &SessionPaths) -> Result<()> {
        atomic::write_json(&Self::path(paths), self)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Replace every record of `video_path` with `records`.
    pub fn upsert_video(&mut self, video_path: &str, records: Vec<SegmentRecord>) {
        self.segments.retain(|s| s.video_path != video_path);
        self.segments.extend(records);
    }

    /// Rank segments against the query vectors.
    ///
    /// The video-space score is always used. When a text-space query vector
    /// is given, segments with a text embedding average both scores.
    pub fn search(
        &self,
        video_query: &[f32],
        text_query: Option<&[f32]>,
        top_k: usize,
    ) -> Vec<RetrievedSegment> {
        let mut scored: Vec<RetrievedSegment> = self
            .segments
            .iter()
            .map(|s| {
                let video_score = cosine_similarity(video_query, &s.video_embedding);
                let score = match text_query {
                    Some(q) if !s.text_embedding.is_empty() => {
                        0.5 * (video_score + cosine_similarity(q, &s.text_embedding))
                    }
                    _ => video_score,
                };
                RetrievedSegment {
                    id: s.id.clone(),
                    video_path: s.video_path.clone(),
                    segment_index: s.segment_index,
                    start: s.start,
                    end: s.end,
                    text: s.text.clone(),
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        scored
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub video_path: String,
    /// Chunk indices (within the video) that mention the entity.
    #[serde(default)]
    pub chunks: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityIndex {
    pub entities: Vec<EntityRecord>,
}

impl EntityIndex {
    fn path(paths: &SessionPaths) -> PathBuf {
        paths.graph_db_dir().join(ENTITIES_FILE)
    }

    pub fn load(paths: &SessionPaths) -> Self {
        atomic::read_json_or_default(&Self::path(paths))
    }

    pub fn save(&self, paths: &SessionPaths) -> Result<()> {
        atomic::write_json(&Self::path(paths), self)
    }

    pub fn upsert_video(&mut self, video_path: &str, records: Vec<EntityRecord>) {
        self.entities.retain(|e| e.video_path != video_path);
        self.entities.extend(records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(video: &str, idx: usize, v: Vec<f32>, t: Vec<f32>) -> SegmentRecord {
        SegmentRecord {
            id: format!("{}#{}", video, idx),
            video_path: video.to_string(),
            segment_index: idx,
            start: idx as f64 * 30.0,
            end: (idx + 1) as f64 * 30.0,
            transcript: String::new(),
            caption: String::new(),
            text: format!("segment {}", idx),
            video_embedding: v,
            text_embedding: t,
        }
    }

    #[test]
    fn test_search_ranks_closest_first() {
        let mut store = VectorStore::default();
        store.upsert_video(
            "/v/a.mp4",
            vec![
                record("/v/a.mp4", 0, vec![1.0, 0.0], vec![]),
                record("/v/a.mp4", 1, vec![0.0, 1.0], vec![]),
                record("/v/a.mp4", 2, vec![0.7, 0.7], vec![]),
            ],
        );
        let hits = store.search(&[0.0, 1.0], None, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].segment_index, 1);
        assert_eq!(hits[1].segment_index, 2);
    }

    #[test]
    fn test_text_vector_blends_score() {
        let mut store = VectorStore::default();
        store.upsert_video(
            "/v/a.mp4",
            vec![
                record("/v/a.mp4", 0, vec![1.0, 0.0], vec![0.0, 1.0]),
                record("/v/a.mp4", 1, vec![0.9, 0.1], vec![1.0, 0.0]),
            ],
        );
        let video_only = store.search(&[1.0, 0.0], None, 1);
        assert_eq!(video_only[0].segment_index, 0);
        let blended = store.search(&[1.0, 0.0], Some(&[1.0, 0.0]), 1);
        assert_eq!(blended[0].segment_index, 1);
    }

    #[test]
    fn test_upsert_replaces_video_and_persists() {
        let tmp = TempDir::new().unwrap();
        let paths = SessionPaths::new(tmp.path(), "s1");

        let mut store = VectorStore::load(&paths);
        assert!(store.is_empty());
        store.upsert_video("/v/a.mp4", vec![record("/v/a.mp4", 0, vec![1.0], vec![])]);
        store.upsert_video("/v/b.mp4", vec![record("/v/b.mp4", 0, vec![1.0], vec![])]);
        store.upsert_video(
            "/v/a.mp4",
            vec![
                record("/v/a.mp4", 0, vec![1.0], vec![]),
                record("/v/a.mp4", 1, vec![1.0], vec![]),
            ],
        );
        store.save(&paths).unwrap();

        let reloaded = VectorStore::load(&paths);
        assert_eq!(reloaded.len(), 3);

        let mut entities = EntityIndex::default();
        entities.upsert_video(
            "/v/a.mp4",
            vec![EntityRecord {
                name: "Alice".into(),
                label: "PERSON".into(),
                video_path: "/v/a.mp4".into(),
                chunks: vec![0],
            }],
        );
        entities.save(&paths).unwrap();
        assert_eq!(EntityIndex::load(&paths).entities.len(), 1);
    }
}
