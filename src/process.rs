//! Worker process management.
//!
//! Each indexing or query job runs in its own OS process: a fresh exec of the
//! `framehub` binary (`framehub worker <kind> --job <file>`), never a fork of
//! the orchestrator. The worker's only input is a job file written into
//! `_cache/jobs/`; its only output is the session's status document and
//! artifacts.
//!
//! The manager keeps one [`ProcessRecord`] per in-flight job, keyed by
//! `session_id` (index) or `session_id + "_query"` (query). Termination is
//! SIGTERM, a bounded wait, then SIGKILL and another bounded wait. The record
//! map lock is never held across those waits.
//!
//! Every worker leads its own process group, and signals go to the whole
//! group, so collaborator commands a worker spawned die with it.
//!
//! Workers are named `<prefix>-index-<session>` / `<prefix>-query-<session>`
//! through argv[0], which lets [`sweep_orphans`] find workers left behind by
//! a previous orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::atomic;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::validate_session_id;
use crate::status::{JobState, Namespace, StatusStore};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The two kinds of worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Query,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Query => "query",
        }
    }

    /// Key of this job's record in the process map.
    pub fn record_key(self, session_id: &str) -> String {
        match self {
            JobKind::Index => session_id.to_string(),
            JobKind::Query => format!("{}_query", session_id),
        }
    }

    pub fn namespace(self) -> Namespace {
        match self {
            JobKind::Index => Namespace::Indexing,
            JobKind::Query => Namespace::Query,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" | "indexing" => Ok(JobKind::Index),
            "query" => Ok(JobKind::Query),
            other => Err(Error::Configuration(format!(
                "unknown job kind '{}': expected index or query",
                other
            ))),
        }
    }
}

/// argv[0] of a worker process.
pub fn process_name(prefix: &str, kind: JobKind, session_id: &str) -> String {
    format!("{}-{}-{}", prefix, kind.as_str(), session_id)
}

/// Does `argv0` follow the worker naming convention for `prefix`?
pub fn is_worker_process_name(prefix: &str, argv0: &str) -> bool {
    let base = argv0.rsplit('/').next().unwrap_or(argv0);
    let Some(rest) = base
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('-'))
    else {
        return false;
    };
    ["index-", "query-"]
        .iter()
        .any(|k| rest.strip_prefix(k).is_some_and(|session| !session.is_empty()))
}

/// Everything a worker needs, written to `_cache/jobs/<kind>-<job_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub kind: JobKind,
    pub session_id: String,
    /// Base URL of the orchestrator's encoder service.
    pub encoder_url: String,
    pub config: Config,
    #[serde(default)]
    pub video_paths: Vec<PathBuf>,
    #[serde(default)]
    pub query: Option<String>,
    pub created_at: String,
}

impl JobSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_json(path, self)
    }
}

/// Starts a worker process for a job.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        job: &JobSpec,
        job_file: &Path,
        process_name: &str,
        log_file: &Path,
    ) -> std::io::Result<Child>;
}

/// Launches `framehub worker <kind> --job <file>` from the running executable.
pub struct SelfExecLauncher {
    exe: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn current() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn launch(
        &self,
        job: &JobSpec,
        job_file: &Path,
        process_name: &str,
        log_file: &Path,
    ) -> std::io::Result<Child> {
        let log = File::create(log_file)?;
        Command::new(&self.exe)
            .arg0(process_name)
            .arg("worker")
            .arg(job.kind.as_str())
            .arg("--job")
            .arg(job_file)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
    }
}

/// One in-flight worker, owned by the manager.
#[derive(Debug)]
pub struct ProcessRecord {
    pub child: Child,
    pub kind: JobKind,
    pub session_id: String,
    pub job_id: String,
    pub process_name: String,
    pub started_at: String,
}

impl ProcessRecord {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn info(&mut self, key: &str) -> ProcessInfo {
        ProcessInfo {
            key: key.to_string(),
            kind: self.kind,
            session_id: self.session_id.clone(),
            job_id: self.job_id.clone(),
            pid: self.pid(),
            alive: self.is_alive(),
            process_name: self.process_name.clone(),
            started_at: self.started_at.clone(),
        }
    }
}

/// Serializable snapshot of a [`ProcessRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub key: String,
    pub kind: JobKind,
    pub session_id: String,
    pub job_id: String,
    pub pid: u32,
    pub alive: bool,
    pub process_name: String,
    pub started_at: String,
}

/// How a tracked process ended during termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Terminated,
    Killed,
    /// Still alive after SIGKILL and the kill timeout.
    Unresponsive,
}

/// Result of [`ProcessManager::cleanup`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub terminated: Vec<String>,
    pub swept: Vec<u32>,
}

pub struct ProcessManager {
    config: Arc<Config>,
    store: Arc<StatusStore>,
    launcher: Arc<dyn WorkerLauncher>,
    encoder_url: String,
    records: Mutex<HashMap<String, ProcessRecord>>,
}

impl ProcessManager {
    pub fn new(config: Arc<Config>, store: Arc<StatusStore>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let encoder_url = config.server.encoder_base_url();
        Self {
            config,
            store,
            launcher,
            encoder_url,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.workers.grace_period_secs)
    }

    fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.config.workers.kill_timeout_secs)
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Start an indexing worker for `session_id`.
    pub fn start_indexing(&self, session_id: &str, video_paths: Vec<PathBuf>) -> Result<ProcessInfo> {
        if video_paths.is_empty() {
            return Err(Error::InvalidRequest("no video paths given".to_string()));
        }
        self.start(JobKind::Index, session_id, video_paths, None)
    }

    /// Start a query worker for `session_id`.
    pub fn start_query(&self, session_id: &str, query: &str) -> Result<ProcessInfo> {
        if query.trim().is_empty() {
            return Err(Error::InvalidRequest("query is empty".to_string()));
        }
        self.start(JobKind::Query, session_id, Vec::new(), Some(query.to_string()))
    }

    fn start(
        &self,
        kind: JobKind,
        session_id: &str,
        video_paths: Vec<PathBuf>,
        query: Option<String>,
    ) -> Result<ProcessInfo> {
        validate_session_id(session_id)?;
        let key = kind.record_key(session_id);

        // Held through the spawn so two concurrent starts cannot both pass.
        let mut records = self.lock();
        if let Some(existing) = records.get_mut(&key) {
            if existing.is_alive() {
                return Err(Error::JobAlreadyRunning {
                    session_id: session_id.to_string(),
                    kind: kind.to_string(),
                });
            }
            tracing::debug!(key = %key, "reaping finished worker record");
            records.remove(&key);
        }

        match kind {
            JobKind::Index => self.store.begin_indexing(session_id, video_paths.len())?,
            JobKind::Query => self
                .store
                .begin_query(session_id, query.as_deref().unwrap_or_default())?,
        }

        let job = JobSpec {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.to_string(),
            encoder_url: self.encoder_url.clone(),
            config: (*self.config).clone(),
            video_paths,
            query,
            created_at: atomic::now_iso(),
        };
        let jobs_dir = self.store.session_paths(session_id).jobs_dir();
        let job_file = jobs_dir.join(format!("{}-{}.json", kind, job.job_id));
        let log_file = jobs_dir.join(format!("{}-{}.log", kind, job.job_id));
        let name = process_name(&self.config.workers.name_prefix, kind, session_id);

        let spawned = job
            .save(&job_file)
            .and_then(|_| Ok(self.launcher.launch(&job, &job_file, &name, &log_file)?));
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start {} worker: {}", kind, e);
                tracing::error!(session = session_id, "{}", message);
                self.store.transition(
                    session_id,
                    kind.namespace(),
                    JobState::Error,
                    json!({ "message": message, "current_step": "Error" }),
                )?;
                return Err(Error::WorkerCrash(message));
            }
        };

        tracing::info!(
            session = session_id,
            pid = child.id(),
            "started {} worker {}",
            kind,
            name
        );
        let mut record = ProcessRecord {
            child,
            kind,
            session_id: session_id.to_string(),
            job_id: job.job_id,
            process_name: name,
            started_at: atomic::now_iso(),
        };
        let info = record.info(&key);
        records.insert(key, record);
        Ok(info)
    }

    /// Terminate every tracked job of `session_id`.
    ///
    /// `indexing_status` is always marked terminated; `query_status` only
    /// when a query job was tracked. Returns the keys of removed records.
    pub fn terminate(&self, session_id: &str) -> Result<Vec<String>> {
        let removed: Vec<(String, ProcessRecord)> = {
            let mut records = self.lock();
            [JobKind::Index, JobKind::Query]
                .iter()
                .filter_map(|kind| {
                    let key = kind.record_key(session_id);
                    records.remove(&key).map(|r| (key, r))
                })
                .collect()
        };

        let mut had_query = false;
        let mut keys = Vec::with_capacity(removed.len());
        for (key, mut record) in removed {
            had_query |= record.kind == JobKind::Query;
            let outcome = stop_child(&mut record.child, self.grace_period(), self.kill_timeout());
            tracing::info!(key = %key, pid = record.pid(), "worker stop: {:?}", outcome);
            keys.push(key);
        }

        self.store.mark_terminated(session_id, Namespace::Indexing)?;
        if had_query {
            self.store.mark_terminated(session_id, Namespace::Query)?;
        }
        Ok(keys)
    }

    /// Terminate everything, then force-kill untracked workers that follow
    /// the naming convention.
    pub fn cleanup(&self) -> CleanupReport {
        let sessions: BTreeSet<String> = self
            .lock()
            .values()
            .map(|r| r.session_id.clone())
            .collect();

        let mut report = CleanupReport::default();
        for session in sessions {
            match self.terminate(&session) {
                Ok(keys) => report.terminated.extend(keys),
                Err(e) => tracing::warn!(session = %session, "terminate failed: {}", e),
            }
        }

        let tracked: HashSet<u32> = self.lock().values().map(ProcessRecord::pid).collect();
        report.swept = sweep_orphans(&self.config.workers.name_prefix, &tracked);
        report
    }

    /// Terminate the session's jobs and remove its directory.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        self.terminate(session_id)?;
        let root = self.store.session_paths(session_id).root;
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
            tracing::info!(session = session_id, "deleted {}", root.display());
            return Ok(true);
        }
        Ok(false)
    }

    /// Namespace object of the status document (`null` when absent).
    pub fn status(&self, session_id: &str, kind: JobKind) -> Value {
        let path = self.store.session_paths(session_id).status_file();
        self.store
            .read(&path)
            .get(kind.namespace().key())
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        let mut records = self.lock();
        let mut out: Vec<ProcessInfo> = records
            .iter_mut()
            .map(|(key, record)| record.info(key))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Sessions with at least one live worker.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut records = self.lock();
        let set: BTreeSet<String> = records
            .values_mut()
            .filter_map(|r| r.is_alive().then(|| r.session_id.clone()))
            .collect();
        set.into_iter().collect()
    }

    pub fn is_running(&self, session_id: &str, kind: JobKind) -> bool {
        self.lock()
            .get_mut(&kind.record_key(session_id))
            .is_some_and(ProcessRecord::is_alive)
    }
}

/// Deliver `signal` to the process group led by `pid`, falling back to
/// `pid` alone when it leads no group. Returns whether a signal was sent.
fn signal_group(pid: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: plain signal delivery; no memory is shared with the target.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

/// SIGTERM, wait up to `grace`, SIGKILL, wait up to `kill_timeout`.
///
/// Signals reach the child's whole process group. Once the child is gone,
/// group members that outlived it are killed as well.
pub fn stop_child(child: &mut Child, grace: Duration, kill_timeout: Duration) -> StopOutcome {
    let pid = child.id() as libc::pid_t;
    if !matches!(child.try_wait(), Ok(None)) {
        // SAFETY: see `signal_group`.
        unsafe { libc::kill(-pid, libc::SIGKILL) };
        return StopOutcome::AlreadyExited;
    }

    signal_group(pid, libc::SIGTERM);
    if wait_for_exit(child, grace) {
        // SAFETY: see `signal_group`.
        unsafe { libc::kill(-pid, libc::SIGKILL) };
        return StopOutcome::Terminated;
    }

    tracing::warn!(pid, "worker ignored SIGTERM, sending SIGKILL");
    if !signal_group(pid, libc::SIGKILL) {
        if let Err(e) = child.kill() {
            tracing::warn!(pid, "SIGKILL failed: {}", e);
        }
    }
    if wait_for_exit(child, kill_timeout) {
        StopOutcome::Killed
    } else {
        tracing::error!(pid, "worker still alive after SIGKILL");
        StopOutcome::Unresponsive
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Force-kill processes whose argv[0] follows the worker naming convention,
/// skipping `exclude` and the current process. Returns the killed pids.
pub fn sweep_orphans(prefix: &str, exclude: &HashSet<u32>) -> Vec<u32> {
    let own_pid = std::process::id();
    let mut system = sysinfo::System::new();
    system.refresh_processes();

    let mut killed = Vec::new();
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if pid == own_pid || exclude.contains(&pid) {
            continue;
        }
        let Some(argv0) = process.cmd().first() else {
            continue;
        };
        if !is_worker_process_name(prefix, argv0) {
            continue;
        }
        if signal_group(pid as libc::pid_t, libc::SIGKILL) {
            tracing::warn!(pid, "killed orphaned worker {}", argv0);
            killed.push(pid);
        }
    }
    killed.sort_unstable();
    killed
}
