//! Query pipeline: retrieve the closest segments and answer.

use serde::{Deserialize, Serialize};

use crate::collab::Collaborators;
use crate::encoder::VectorEncoder;
use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::session::SessionPaths;
use crate::vector_store::{RetrievedSegment, VectorStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<RetrievedSegment>,
}

pub struct QueryPipeline<'a> {
    paths: &'a SessionPaths,
    collab: &'a dyn Collaborators,
    encoder: &'a dyn VectorEncoder,
    top_k: usize,
    progress: &'a dyn ProgressReporter,
}

impl<'a> QueryPipeline<'a> {
    pub fn new(
        paths: &'a SessionPaths,
        collab: &'a dyn Collaborators,
        encoder: &'a dyn VectorEncoder,
        top_k: usize,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            paths,
            collab,
            encoder,
            top_k,
            progress,
        }
    }

    fn step(&self, step: &str, message: String) {
        self.progress.report(ProgressEvent::QueryStep {
            step: step.to_string(),
            message,
        });
    }

    pub fn run(&self, query: &str) -> Result<QueryAnswer> {
        self.step("Loading index", "Loading session index...".to_string());
        let store = VectorStore::load(self.paths);
        if store.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "session {} has no indexed videos",
                self.paths.session_id
            )));
        }

        self.step("Encoding query", "Encoding query...".to_string());
        let video_query = self.encoder.encode_string_query(query)?;
        let has_text = store.segments.iter().any(|s| !s.text_embedding.is_empty());
        let text_query = if has_text {
            match self.collab.embed_texts(&[query.to_string()]) {
                Ok(mut v) => v.pop(),
                Err(e) => {
                    tracing::warn!("text query embedding unavailable, using video scores only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.step(
            "Searching",
            format!("Searching {} segments...", store.len()),
        );
        let hits = store.search(&video_query, text_query.as_deref(), self.top_k);

        self.step("Generating answer", "Generating answer...".to_string());
        let answer = match self.collab.answer(query, &hits)? {
            Some(answer) => answer,
            None => summarize(query, &hits),
        };

        Ok(QueryAnswer {
            query: query.to_string(),
            answer,
            sources: hits,
        })
    }
}

/// Answer used when no answerer is configured: the ranked segments.
pub fn summarize(query: &str, hits: &[RetrievedSegment]) -> String {
    if hits.is_empty() {
        return format!("No indexed segments matched \"{}\".", query);
    }
    let mut out = format!("Most relevant segments for \"{}\":", query);
    for (rank, hit) in hits.iter().enumerate() {
        let name = hit.video_path.rsplit('/').next().unwrap_or(&hit.video_path);
        let excerpt: String = hit.text.chars().take(200).collect();
        out.push_str(&format!(
            "\n{}. {} [{} - {}] (score {:.3}) {}",
            rank + 1,
            name,
            timestamp(hit.start),
            timestamp(hit.end),
            hit.score,
            excerpt.replace('\n', " ")
        ));
    }
    out
}

fn timestamp(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}
