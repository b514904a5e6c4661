//! Error taxonomy shared by the stores, the encoder service and the
//! process manager.
//!
//! Library code returns [`Result<T>`] with a typed [`Error`] so callers can
//! decide what is retryable. Application edges (`main`, the worker entry
//! points, CLI commands) wrap these in `anyhow` with context.

use thiserror::Error;

/// Errors raised by framehub components.
#[derive(Debug, Error)]
pub enum Error {
    /// A required setting is missing or invalid. Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An encode call reached the encoder before the model was loaded.
    /// Safe to retry after `ensure_loaded()`.
    #[error("resource not ready: {0}")]
    ResourceNotReady(String),

    /// Filesystem failure. Not retried by this layer.
    #[error("I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// A worker failed. Written into the status document, never raised
    /// across the process boundary.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// The encoder service answered with a non-2xx status or `success:false`.
    #[error("encoder service error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    /// Transport failure talking to the encoder service.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A status update tried to leave a terminal state or skip `processing`.
    #[error("invalid status transition for {namespace}: {from} -> {to}")]
    InvalidTransition {
        namespace: String,
        from: String,
        to: String,
    },

    /// A job of the same kind is already running for the session.
    #[error("a {kind} job is already running for session {session_id}")]
    JobAlreadyRunning { session_id: String, kind: String },

    /// A request was well-formed JSON but semantically unusable (empty
    /// batch, missing input file).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// An external collaborator (splitter, transcriber, ...) failed.
    #[error("collaborator '{name}' failed: {message}")]
    Collaborator { name: String, message: String },

    /// The binary vector payload was malformed.
    #[error("malformed vector blob: {0}")]
    Blob(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-readable code used in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::ResourceNotReady(_) => "not_ready",
            Error::TransientIo(_) => "io",
            Error::WorkerCrash(_) => "worker_crash",
            Error::Remote { .. } => "remote",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::JobAlreadyRunning { .. } => "conflict",
            Error::InvalidRequest(_) => "invalid_request",
            Error::UnknownStage(_) => "unknown_stage",
            Error::Collaborator { .. } => "collaborator",
            Error::Blob(_) => "blob",
        }
    }
}
