//! The ten-stage indexing pipeline.
//!
//! Runs inside an index worker, one video at a time:
//!
//! | # | Stage | Output |
//! |---|-------|--------|
//! | 01 | upload | video metadata |
//! | 02 | split | segment files in `_cache/NNN_<video>/`, timings |
//! | 03 | transcribe | `transcripts_by_segment/segment_NNN.json` |
//! | 04 | caption | `captions_by_segment/segment_NNN.json` |
//! | 05 | merge | per-segment transcript + caption |
//! | 06 | feature extract | `video_embeddings.bin` via the shared encoder |
//! | 07 | chunk | paragraph chunks of merged text |
//! | 08 | entity extract | entities per chunk |
//! | 09 | embed | `text_embeddings.bin` |
//! | 10 | index | `final_outputs/vector_db`, `final_outputs/graph_db` |
//!
//! Every stage marks itself `processing` before doing any work, so a crash
//! leaves the failing stage visible in the artifact progress.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::artifacts::{ArtifactStore, LogLevel, Stage};
use crate::atomic::ArtifactContent;
use crate::chunk::{chunk_segments, TextChunk};
use crate::collab::{CaptionInput, Collaborators, SegmentTiming, SplitRequest};
use crate::config::PipelineConfig;
use crate::encoder::{encode_matrix, VectorEncoder};
use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::status::StatusStore;
use crate::vector_store::{EntityIndex, EntityRecord, SegmentRecord, VectorStore};

#[derive(Debug, Clone, Serialize)]
pub struct VideoSummary {
    pub video_path: String,
    pub segments: usize,
    pub chunks: usize,
    pub entities: usize,
    pub seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub session_id: String,
    pub videos: Vec<VideoSummary>,
    pub total_segments: usize,
}

pub struct IndexPipeline<'a> {
    artifacts: &'a ArtifactStore,
    status: &'a StatusStore,
    collab: &'a dyn Collaborators,
    encoder: &'a dyn VectorEncoder,
    config: &'a PipelineConfig,
    progress: &'a dyn ProgressReporter,
}

/// Per-segment data after merging.
struct MergedSegment {
    path: PathBuf,
    timing: SegmentTiming,
    transcript: String,
    caption: String,
    text: String,
}

impl<'a> IndexPipeline<'a> {
    pub fn new(
        artifacts: &'a ArtifactStore,
        status: &'a StatusStore,
        collab: &'a dyn Collaborators,
        encoder: &'a dyn VectorEncoder,
        config: &'a PipelineConfig,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            artifacts,
            status,
            collab,
            encoder,
            config,
            progress,
        }
    }

    /// Index every video in order. Each finished video is appended to
    /// `indexed_videos` before the next one starts.
    pub fn run(&self, videos: &[PathBuf]) -> Result<IndexSummary> {
        let session_id = self.artifacts.session_id().to_string();
        let total = videos.len();
        let mut summary = IndexSummary {
            session_id: session_id.clone(),
            videos: Vec::with_capacity(total),
            total_segments: 0,
        };

        for (i, video) in videos.iter().enumerate() {
            let display = video.display().to_string();
            self.progress.report(ProgressEvent::VideoStarted {
                index: i + 1,
                total,
                video: display.clone(),
            });
            let video_summary = self.index_video(i, video)?;
            summary.total_segments += video_summary.segments;
            summary.videos.push(video_summary);
            self.status.add_indexed_video(&session_id, &display)?;
            self.progress.report(ProgressEvent::VideoFinished {
                index: i + 1,
                total,
                video: display,
            });
        }

        self.artifacts.save_processing_summary(&summary)?;
        Ok(summary)
    }

    fn stage<T>(&self, stage: Stage, video: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        self.artifacts.begin_step(stage)?;
        self.progress.report(ProgressEvent::StageStarted {
            video: video.to_string(),
            stage,
        });
        let started = Instant::now();
        match work() {
            Ok(v) => {
                self.artifacts.append_log(
                    stage,
                    &format!("{} done in {:.2}s", video, started.elapsed().as_secs_f64()),
                    LogLevel::Info,
                )?;
                Ok(v)
            }
            Err(e) => {
                let _ = self
                    .artifacts
                    .append_log(stage, &format!("{} failed: {}", video, e), LogLevel::Error);
                Err(e)
            }
        }
    }

    fn index_video(&self, ordinal: usize, video: &Path) -> Result<VideoSummary> {
        let started = Instant::now();
        let video_path = video.display().to_string();
        let name = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let art = self.artifacts;

        // 01: upload
        self.stage(Stage::Upload, &video_path, || {
            let meta = std::fs::metadata(video).map_err(|e| {
                Error::InvalidRequest(format!("cannot read video {}: {}", video_path, e))
            })?;
            art.save_step_result(
                Stage::Upload,
                &json!({
                    "video_path": video_path,
                    "video_name": name,
                    "size_bytes": meta.len(),
                }),
                None,
            )
        })?;

        // 02: split
        let output_dir = art.paths().video_cache_dir(ordinal, &name);
        let segments: BTreeMap<usize, (PathBuf, SegmentTiming)> =
            self.stage(Stage::Split, &video_path, || {
                std::fs::create_dir_all(&output_dir)?;
                art.save_step_config(
                    Stage::Split,
                    &json!({
                        "segment_length": self.config.segment_length,
                        "frames_per_segment": self.config.frames_per_segment,
                        "output_dir": output_dir,
                    }),
                )?;
                let split = self.collab.split(&SplitRequest {
                    video_path: video,
                    segment_length: self.config.segment_length,
                    frames_per_segment: self.config.frames_per_segment,
                    output_dir: &output_dir,
                })?;
                if split.segments.is_empty() {
                    return Err(Error::Collaborator {
                        name: "splitter".to_string(),
                        message: format!("no segments produced for {}", video_path),
                    });
                }
                let length = f64::from(self.config.segment_length);
                let segments: BTreeMap<usize, (PathBuf, SegmentTiming)> = split
                    .segments
                    .iter()
                    .map(|(&i, file)| {
                        let timing = split.timings.get(&i).copied().unwrap_or(SegmentTiming {
                            start: i as f64 * length,
                            end: (i + 1) as f64 * length,
                        });
                        (i, (output_dir.join(file), timing))
                    })
                    .collect();
                art.save_step_result(
                    Stage::Split,
                    &json!({
                        "video_path": video_path,
                        "segment_count": segments.len(),
                        "segments": split.segments,
                        "timings": split.timings,
                    }),
                    None,
                )?;
                Ok(segments)
            })?;
        let total = segments.len();
        let segment_paths: BTreeMap<usize, PathBuf> = segments
            .iter()
            .map(|(&i, (path, _))| (i, path.clone()))
            .collect();

        // 03: transcribe
        let transcripts = self.stage(Stage::Transcribe, &video_path, || {
            let transcripts = self.collab.transcribe(&segment_paths)?;
            for (done, (&i, text)) in transcripts.iter().enumerate() {
                art.save_segment_artifact(Stage::Transcribe, i, text)?;
                self.progress.report(ProgressEvent::SegmentDone {
                    video: video_path.clone(),
                    stage: Stage::Transcribe,
                    done: done + 1,
                    total,
                });
            }
            art.save_step_result(
                Stage::Transcribe,
                &json!({ "video_path": video_path, "transcripts": transcripts }),
                None,
            )?;
            Ok(transcripts)
        })?;

        // 04: caption, one segment per call so each caption lands as soon
        // as it exists
        let captions = self.stage(Stage::Caption, &video_path, || {
            let mut captions = BTreeMap::new();
            for (done, (&i, path)) in segment_paths.iter().enumerate() {
                let mut input = BTreeMap::new();
                input.insert(
                    i,
                    CaptionInput {
                        video_path: path.clone(),
                        transcript: transcripts.get(&i).cloned().unwrap_or_default(),
                    },
                );
                let text = self.collab.caption(&input)?.remove(&i).unwrap_or_default();
                art.save_segment_artifact(Stage::Caption, i, &text)?;
                captions.insert(i, text);
                self.progress.report(ProgressEvent::SegmentDone {
                    video: video_path.clone(),
                    stage: Stage::Caption,
                    done: done + 1,
                    total,
                });
            }
            art.save_step_result(
                Stage::Caption,
                &json!({ "video_path": video_path, "captions": captions }),
                None,
            )?;
            Ok(captions)
        })?;

        // 05: merge
        let merged: BTreeMap<usize, MergedSegment> = self.stage(Stage::Merge, &video_path, || {
            let merged: BTreeMap<usize, MergedSegment> = segments
                .iter()
                .map(|(&i, (path, timing))| {
                    let transcript = transcripts.get(&i).cloned().unwrap_or_default();
                    let caption = captions.get(&i).cloned().unwrap_or_default();
                    let text = merge_text(&transcript, &caption);
                    let segment = MergedSegment {
                        path: path.clone(),
                        timing: *timing,
                        transcript,
                        caption,
                        text,
                    };
                    (i, segment)
                })
                .collect();
            let rows: Vec<_> = merged
                .iter()
                .map(|(i, s)| {
                    json!({
                        "segment_index": i,
                        "start": s.timing.start,
                        "end": s.timing.end,
                        "transcript": s.transcript,
                        "caption": s.caption,
                        "text": s.text,
                    })
                })
                .collect();
            art.save_step_result(
                Stage::Merge,
                &json!({ "video_path": video_path, "segments": rows }),
                None,
            )?;
            Ok(merged)
        })?;

        // 06: feature extraction through the shared encoder
        let video_vectors = self.stage(Stage::FeatureExtract, &video_path, || {
            let paths: Vec<PathBuf> = merged.values().map(|s| s.path.clone()).collect();
            let vectors = self.encoder.encode_video_segments(&paths)?;
            art.write(
                Stage::FeatureExtract,
                "video_embeddings.bin",
                &ArtifactContent::Binary(encode_matrix(&vectors)?),
            )?;
            art.save_step_result(
                Stage::FeatureExtract,
                &json!({
                    "video_path": video_path,
                    "shape": [vectors.len(), vectors.first().map(Vec::len).unwrap_or(0)],
                    "file": "video_embeddings.bin",
                }),
                None,
            )?;
            Ok(vectors)
        })?;

        // 07: chunk
        let chunks: Vec<TextChunk> = self.stage(Stage::Chunk, &video_path, || {
            let texts: BTreeMap<usize, String> =
                merged.iter().map(|(&i, s)| (i, s.text.clone())).collect();
            let chunks = chunk_segments(&texts, self.config.chunk_max_tokens);
            art.save_step_config(
                Stage::Chunk,
                &json!({ "max_tokens": self.config.chunk_max_tokens }),
            )?;
            art.save_step_result(
                Stage::Chunk,
                &json!({ "video_path": video_path, "chunks": chunks }),
                None,
            )?;
            Ok(chunks)
        })?;
        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        // 08: entity extraction
        let entities = self.stage(Stage::EntityExtract, &video_path, || {
            let entities = self.collab.extract_entities(&chunk_texts)?;
            art.save_step_result(
                Stage::EntityExtract,
                &json!({ "video_path": video_path, "entities": entities }),
                None,
            )?;
            Ok(entities)
        })?;

        // 09: text embeddings
        let text_vectors = self.stage(Stage::Embed, &video_path, || {
            let vectors = self.collab.embed_texts(&chunk_texts)?;
            art.write(
                Stage::Embed,
                "text_embeddings.bin",
                &ArtifactContent::Binary(encode_matrix(&vectors)?),
            )?;
            art.save_step_result(
                Stage::Embed,
                &json!({
                    "video_path": video_path,
                    "shape": [vectors.len(), vectors.first().map(Vec::len).unwrap_or(0)],
                    "file": "text_embeddings.bin",
                }),
                None,
            )?;
            Ok(vectors)
        })?;

        // 10: index construction
        self.stage(Stage::Index, &video_path, || {
            let mut by_segment: BTreeMap<usize, Vec<&[f32]>> = BTreeMap::new();
            for (chunk, vector) in chunks.iter().zip(&text_vectors) {
                by_segment.entry(chunk.segment_index).or_default().push(vector);
            }

            let records: Vec<SegmentRecord> = merged
                .iter()
                .zip(&video_vectors)
                .map(|((&i, s), video_embedding)| SegmentRecord {
                    id: format!("{}#{}", video_path, i),
                    video_path: video_path.clone(),
                    segment_index: i,
                    start: s.timing.start,
                    end: s.timing.end,
                    transcript: s.transcript.clone(),
                    caption: s.caption.clone(),
                    text: s.text.clone(),
                    video_embedding: video_embedding.clone(),
                    text_embedding: by_segment.get(&i).map(|v| mean(v)).unwrap_or_default(),
                })
                .collect();
            let indexed = records.len();

            let paths = art.paths();
            let mut store = VectorStore::load(paths);
            store.upsert_video(&video_path, records);
            store.save(paths)?;

            let mut graph = EntityIndex::load(paths);
            graph.upsert_video(
                &video_path,
                entities
                    .iter()
                    .map(|e| EntityRecord {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        video_path: video_path.clone(),
                        chunks: e.chunks.clone(),
                    })
                    .collect(),
            );
            graph.save(paths)?;

            art.save_step_result(
                Stage::Index,
                &json!({
                    "video_path": video_path,
                    "segments_indexed": indexed,
                    "entities_indexed": entities.len(),
                    "total_segments": store.len(),
                }),
                None,
            )
        })?;

        Ok(VideoSummary {
            video_path,
            segments: total,
            chunks: chunks.len(),
            entities: entities.len(),
            seconds: started.elapsed().as_secs_f64(),
        })
    }
}

fn merge_text(transcript: &str, caption: &str) -> String {
    [transcript.trim(), caption.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Element-wise mean; empty for no vectors or mismatched widths.
fn mean(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dims = first.len();
    if vectors.iter().any(|v| v.len() != dims) {
        return Vec::new();
    }
    let mut out = vec![0.0f32; dims];
    for v in vectors {
        for (acc, x) in out.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    out.iter_mut().for_each(|x| *x /= n);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collab::{Entity, SplitOutput};
    use crate::encoder::{LoadedModel, ModelBackend, SharedEncoder};
    use crate::progress::NoProgress;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Three segments per video; texts mention the video stem.
    pub(crate) struct FakeCollaborators;

    impl Collaborators for FakeCollaborators {
        fn split(&self, request: &SplitRequest<'_>) -> Result<SplitOutput> {
            let mut out = SplitOutput::default();
            for i in 0..3 {
                let name = format!("segment_{:03}.mp4", i);
                std::fs::write(request.output_dir.join(&name), b"segment")?;
                out.segments.insert(i, name);
            }
            Ok(out)
        }

        fn transcribe(&self, segments: &BTreeMap<usize, PathBuf>) -> Result<BTreeMap<usize, String>> {
            Ok(segments
                .iter()
                .map(|(&i, p)| (i, format!("spoken words {}", p.display())))
                .collect())
        }

        fn caption(&self, segments: &BTreeMap<usize, CaptionInput>) -> Result<BTreeMap<usize, String>> {
            Ok(segments
                .keys()
                .map(|&i| (i, format!("scene number {}", i)))
                .collect())
        }

        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn extract_entities(&self, texts: &[String]) -> Result<Vec<Entity>> {
            Ok(vec![Entity {
                name: "Narrator".into(),
                label: "PERSON".into(),
                chunks: (0..texts.len()).collect(),
            }])
        }
    }

    /// Segment `segment_00N` encodes to the unit vector on axis N.
    pub(crate) struct AxisBackend;

    struct AxisModel;

    impl LoadedModel for AxisModel {
        fn encode_videos(&mut self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
            Ok(segments
                .iter()
                .map(|p| {
                    let stem = p.file_stem().unwrap().to_string_lossy().to_string();
                    let axis: usize = stem.trim_start_matches("segment_").parse().unwrap_or(0);
                    let mut v = vec![0.0; 4];
                    v[axis % 4] = 1.0;
                    v
                })
                .collect())
        }

        fn encode_text(&mut self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0; 4];
            v[text.len() % 4] = 1.0;
            Ok(v)
        }
    }

    impl ModelBackend for AxisBackend {
        fn name(&self) -> &str {
            "axis"
        }

        fn default_model(&self) -> &str {
            "axis"
        }

        fn load(&self, _model_path: &str) -> Result<Box<dyn LoadedModel>> {
            Ok(Box::new(AxisModel))
        }
    }

    pub(crate) fn loaded_encoder() -> SharedEncoder {
        let encoder = SharedEncoder::new(Arc::new(AxisBackend));
        encoder.initialize(None);
        encoder.ensure_loaded().unwrap();
        encoder
    }

    #[test]
    fn test_pipeline_writes_every_stage() {
        let tmp = TempDir::new().unwrap();
        let video = tmp.path().join("talk.mp4");
        std::fs::write(&video, b"video bytes").unwrap();

        let storage = tmp.path().join("storage");
        let status = StatusStore::new(&storage);
        status.begin_indexing("s1", 1).unwrap();
        let artifacts = ArtifactStore::open(&storage, "s1").unwrap();
        let encoder = loaded_encoder();
        let config = PipelineConfig::default();

        let pipeline = IndexPipeline::new(
            &artifacts,
            &status,
            &FakeCollaborators,
            &encoder,
            &config,
            &NoProgress,
        );
        let summary = pipeline.run(&[video.clone()]).unwrap();
        assert_eq!(summary.total_segments, 3);

        for stage in Stage::ALL {
            assert_eq!(artifacts.status(stage), "completed", "stage {}", stage);
        }
        assert_eq!(artifacts.load_segment_artifacts(Stage::Transcribe).len(), 3);
        assert_eq!(artifacts.load_segment_artifacts(Stage::Caption).len(), 3);

        let blob = artifacts
            .read_binary(Stage::FeatureExtract, "video_embeddings.bin")
            .unwrap()
            .unwrap();
        assert_eq!(crate::encoder::decode_matrix(&blob).unwrap().len(), 3);

        let store = VectorStore::load(artifacts.paths());
        assert_eq!(store.len(), 3);
        let hits = store.search(&[0.0, 1.0, 0.0, 0.0], None, 1);
        assert_eq!(hits[0].segment_index, 1);
        assert!(!store.segments[0].text_embedding.is_empty());

        assert_eq!(EntityIndex::load(artifacts.paths()).entities.len(), 1);
        assert_eq!(status.indexed_videos("s1"), vec![video.display().to_string()]);
        assert_eq!(status.indexing_status("s1").unwrap().processed_videos, Some(1));
        assert!(artifacts
            .paths()
            .intermediates_dir()
            .join("processing_summary.json")
            .exists());
    }

    #[test]
    fn test_same_file_name_in_two_folders_gets_two_cache_dirs() {
        let tmp = TempDir::new().unwrap();
        let videos: Vec<PathBuf> = ["a", "b"]
            .iter()
            .map(|dir| {
                let path = tmp.path().join(dir).join("clip.mp4");
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, dir.as_bytes()).unwrap();
                path
            })
            .collect();

        let storage = tmp.path().join("storage");
        let status = StatusStore::new(&storage);
        status.begin_indexing("s1", 2).unwrap();
        let artifacts = ArtifactStore::open(&storage, "s1").unwrap();
        let encoder = loaded_encoder();
        let config = PipelineConfig::default();
        let pipeline = IndexPipeline::new(
            &artifacts,
            &status,
            &FakeCollaborators,
            &encoder,
            &config,
            &NoProgress,
        );
        let summary = pipeline.run(&videos).unwrap();
        assert_eq!(summary.total_segments, 6);

        let first = artifacts.paths().video_cache_dir(0, "clip");
        let second = artifacts.paths().video_cache_dir(1, "clip");
        assert_ne!(first, second);
        assert!(first.join("segment_000.mp4").exists());
        assert!(second.join("segment_000.mp4").exists());
    }

    #[test]
    fn test_missing_video_fails_at_upload() {
        let tmp = TempDir::new().unwrap();
        let status = StatusStore::new(tmp.path());
        let artifacts = ArtifactStore::open(tmp.path(), "s1").unwrap();
        let encoder = loaded_encoder();
        let config = PipelineConfig::default();
        let pipeline = IndexPipeline::new(
            &artifacts,
            &status,
            &FakeCollaborators,
            &encoder,
            &config,
            &NoProgress,
        );

        let err = pipeline.run(&[PathBuf::from("/nope/missing.mp4")]).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(artifacts.status(Stage::Upload), "processing");
        assert_eq!(artifacts.read_log(Stage::Upload)[0]["level"], "ERROR");
        assert!(status.indexed_videos("s1").is_empty());
    }

    #[test]
    fn test_merge_text_and_mean() {
        assert_eq!(merge_text(" a ", ""), "a");
        assert_eq!(merge_text("a", "b"), "a\n\nb");
        assert_eq!(mean(&[&[1.0, 3.0], &[3.0, 5.0]]), vec![2.0, 4.0]);
        assert!(mean(&[&[1.0], &[1.0, 2.0]]).is_empty());
    }
}
