//! Entry points that run inside a spawned worker process.
//!
//! `framehub worker index --job <file>` and `framehub worker query --job
//! <file>` land here. The worker reads its job file, talks to the
//! orchestrator's encoder over HTTP and reports only through the status
//! document and artifacts. Any failure is caught here, recorded in the
//! session error log and written into the status document as `error`; the
//! process then exits non-zero, but nothing depends on that exit code.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::client::EncoderClient;
use crate::collab::CommandCollaborators;
use crate::error::Error;
use crate::pipeline::IndexPipeline;
use crate::process::{JobKind, JobSpec};
use crate::progress::StatusProgress;
use crate::query::QueryPipeline;
use crate::status::{JobState, StatusStore};

pub fn run_worker(kind: JobKind, job_file: &Path) -> Result<()> {
    let job = JobSpec::load(job_file)
        .with_context(|| format!("Failed to read job file: {}", job_file.display()))?;
    if job.kind != kind {
        bail!(
            "job file {} is a {} job, not {}",
            job_file.display(),
            job.kind,
            kind
        );
    }

    let store = Arc::new(StatusStore::new(&job.config.storage.base_path));
    tracing::info!(
        session = %job.session_id,
        job = %job.job_id,
        "{} worker started (pid {})",
        kind,
        std::process::id()
    );

    let result = match kind {
        JobKind::Index => run_index_job(&job, &store),
        JobKind::Query => run_query_job(&job, &store),
    };
    if let Err(e) = &result {
        fail_job(&job, &store, e);
    }
    result
}

fn run_index_job(job: &JobSpec, store: &Arc<StatusStore>) -> Result<()> {
    let base = &job.config.storage.base_path;
    let artifacts = ArtifactStore::open(base, &job.session_id)?;
    artifacts.save_step_config(crate::artifacts::Stage::Upload, &json!({
        "job_id": job.job_id,
        "video_paths": job.video_paths,
        "pipeline": job.config.pipeline,
    }))?;

    let client = EncoderClient::new(&job.encoder_url, &job.config.client)?;
    client
        .load()
        .with_context(|| format!("Encoder service at {} could not load its model", job.encoder_url))?;
    let collab = CommandCollaborators::new(job.config.collaborators.clone());
    let progress = StatusProgress::new(store.clone(), job.session_id.clone());

    let pipeline = IndexPipeline::new(
        &artifacts,
        store,
        &collab,
        &client,
        &job.config.pipeline,
        &progress,
    );
    let summary = pipeline.run(&job.video_paths)?;
    let removed = artifacts.cleanup_temp_files();
    if removed > 0 {
        tracing::debug!("removed {} stale temp files", removed);
    }

    store.transition(
        &job.session_id,
        JobKind::Index.namespace(),
        JobState::Completed,
        json!({
            "message": format!(
                "Indexed {} videos ({} segments)",
                summary.videos.len(),
                summary.total_segments
            ),
            "current_step": "Completed",
        }),
    )?;
    tracing::info!(session = %job.session_id, "indexing completed");
    Ok(())
}

fn run_query_job(job: &JobSpec, store: &Arc<StatusStore>) -> Result<()> {
    let Some(query) = job.query.as_deref() else {
        bail!("query job {} has no query", job.job_id);
    };
    let paths = store.session_paths(&job.session_id);
    let client = EncoderClient::new(&job.encoder_url, &job.config.client)?;
    client
        .load()
        .with_context(|| format!("Encoder service at {} could not load its model", job.encoder_url))?;
    let collab = CommandCollaborators::new(job.config.collaborators.clone());
    let progress = StatusProgress::new(store.clone(), job.session_id.clone());

    let answer = QueryPipeline::new(
        &paths,
        &collab,
        &client,
        job.config.pipeline.query_top_k,
        &progress,
    )
    .run(query)?;

    store.transition(
        &job.session_id,
        JobKind::Query.namespace(),
        JobState::Completed,
        json!({
            "message": "Query processed",
            "current_step": "Completed",
            "answer": answer.answer,
            "sources": answer.sources,
            "completed_at": crate::atomic::now_epoch_secs(),
        }),
    )?;
    tracing::info!(session = %job.session_id, "query completed");
    Ok(())
}

/// Record a worker failure in the error log and the status document.
fn fail_job(job: &JobSpec, store: &StatusStore, err: &anyhow::Error) {
    let message = format!("{:#}", err);
    tracing::error!(session = %job.session_id, "{} job failed: {}", job.kind, message);

    match ArtifactStore::open(&job.config.storage.base_path, &job.session_id) {
        Ok(artifacts) => {
            let entry = json!({
                "job_id": job.job_id,
                "kind": job.kind,
                "error": message,
            });
            if let Err(e) = artifacts.record_error(&entry) {
                tracing::warn!("failed to record error: {}", e);
            }
        }
        Err(e) => tracing::warn!("failed to open artifact store: {}", e),
    }

    let update = store.transition(
        &job.session_id,
        job.kind.namespace(),
        JobState::Error,
        json!({ "message": format!("Error: {}", message), "current_step": "Error" }),
    );
    match update {
        Ok(_) => {}
        // Terminated by the orchestrator while failing; keep `terminated`.
        Err(Error::InvalidTransition { from, .. }) => {
            tracing::info!("status already {}, not overwriting with error", from)
        }
        Err(e) => tracing::warn!("failed to write error status: {}", e),
    }
}
