//! # framehub
//!
//! Video indexing and retrieval with isolated worker processes.
//!
//! One orchestrator process hosts a shared encoder model and a session API.
//! Every indexing or query job runs in a fresh worker process that reports
//! back only through files: a per-session status document and a tree of
//! per-stage artifacts, both written atomically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────┐
//! │ Orchestrator (framehub serve)│ spawn  │ Worker (index/query) │
//! │  SharedEncoder  ◀────────────┼─HTTP───┤  EncoderClient       │
//! │  ProcessManager ─────────────┼───────▶│  IndexPipeline       │
//! │  StatusStore                 │        │  QueryPipeline       │
//! └──────────────┬───────────────┘        └──────────┬───────────┘
//!                │        status.json, artifacts      │
//!                └───────────────▶ disk ◀─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed error taxonomy |
//! | [`atomic`] | Write-to-temp-then-rename persistence |
//! | [`session`] | Per-session directory layout |
//! | [`status`] | Crash-safe status document |
//! | [`artifacts`] | Per-stage artifact store |
//! | [`encoder`] | Shared encoder, model backends, vector blobs |
//! | [`client`] | Blocking HTTP client for the encoder service |
//! | [`process`] | Worker process lifecycle |
//! | [`collab`] | External collaborator commands |
//! | [`chunk`] | Text chunking |
//! | [`vector_store`] | Session vector store and entity index |
//! | [`progress`] | Progress reporting |
//! | [`pipeline`] | Ten-stage indexing pipeline |
//! | [`query`] | Query pipeline |
//! | [`worker`] | Worker process entry points |
//! | [`server`] | Orchestrator HTTP server |

pub mod artifacts;
pub mod atomic;
pub mod chunk;
pub mod client;
pub mod collab;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod query;
pub mod server;
pub mod session;
pub mod status;
pub mod vector_store;
pub mod worker;
