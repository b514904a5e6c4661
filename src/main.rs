//! # framehub CLI
//!
//! The `framehub` binary runs the orchestrator, inspects sessions, and is
//! also the executable every worker process is started from.
//!
//! ## Usage
//!
//! ```bash
//! framehub --config ./config/framehub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `framehub serve` | Start the orchestrator (encoder service + session API) |
//! | `framehub status <session>` | Print a session's status document |
//! | `framehub progress <session>` | Print per-stage progress from the artifacts |
//! | `framehub sweep` | Kill worker processes left behind by a dead orchestrator |
//!
//! `framehub worker <index|query> --job <file>` is started by the
//! orchestrator and is not meant to be run by hand.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use framehub::artifacts::ArtifactStore;
use framehub::config::load_config;
use framehub::process::{sweep_orphans, JobKind};
use framehub::status::StatusStore;

/// framehub: video indexing and retrieval with isolated worker processes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/framehub.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "framehub",
    about = "framehub: video indexing and retrieval with isolated worker processes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/framehub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator HTTP server.
    ///
    /// Hosts the shared encoder under `/api/encoder` and the session API
    /// under `/api/sessions`. Ctrl-C or SIGTERM terminates all workers
    /// before exit.
    Serve,

    /// Print a session's status document.
    Status {
        session: String,

        /// Only one namespace: `index` or `query`.
        #[arg(long)]
        kind: Option<JobKind>,
    },

    /// Print per-stage progress of a session.
    Progress { session: String },

    /// Kill untracked worker processes that follow the naming convention.
    Sweep,

    /// Run a worker job (started by the orchestrator).
    #[command(hide = true)]
    Worker {
        kind: JobKind,

        /// Job file written by the orchestrator.
        #[arg(long)]
        job: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = load_config(&cli.config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(framehub::server::run_server(config))?;
        }
        Commands::Status { session, kind } => {
            let config = load_config(&cli.config)?;
            let store = StatusStore::new(&config.storage.base_path);
            let paths = store.session_paths(&session);
            if !paths.status_file().exists() {
                bail!("No status document for session '{}'", session);
            }
            let doc = store.read(&paths.status_file());
            let view = match kind {
                Some(kind) => doc
                    .get(kind.namespace().key())
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                None => doc,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Progress { session } => {
            let config = load_config(&cli.config)?;
            let store = StatusStore::new(&config.storage.base_path);
            if !store.session_paths(&session).root.exists() {
                bail!("Session '{}' not found under {}", session, config.storage.base_path.display());
            }
            let progress = ArtifactStore::open(&config.storage.base_path, &session)?.progress();
            println!(
                "Session {}: {}/{} stages completed ({:.0}%)",
                progress.session_id,
                progress.completed_steps,
                progress.total_steps,
                progress.progress_percentage
            );
            for step in &progress.steps_status {
                println!("  {:<32} {}", step.stage.dir_name(), step.status);
            }
        }
        Commands::Sweep => {
            let config = load_config(&cli.config)?;
            let killed = sweep_orphans(&config.workers.name_prefix, &HashSet::new());
            if killed.is_empty() {
                println!("No orphaned workers found.");
            } else {
                println!("Killed {} orphaned workers: {:?}", killed.len(), killed);
            }
        }
        Commands::Worker { kind, job } => {
            framehub::worker::run_worker(kind, &job)?;
        }
    }

    Ok(())
}
