//! Session directory layout.
//!
//! Each session owns exactly one `chat-{id}` directory. Callers sometimes
//! hand in a base path that already points inside a session (a worker that
//! received the session directory as its storage root, for example), so
//! [`SessionPaths::new`] canonicalizes to the outermost `chat-{id}`
//! component instead of nesting a second copy.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the per-session status document.
pub const STATUS_FILE: &str = "status.json";

/// Directory name for a session id.
pub fn session_dir_name(session_id: &str) -> String {
    format!("chat-{}", session_id)
}

/// Reject ids that would escape the storage root or produce odd paths.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && session_id != "."
        && session_id != "..";
    if ok {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid session id '{}': use letters, digits, '-', '_' or '.'",
            session_id
        )))
    }
}

/// Resolved on-disk locations for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub session_id: String,
    pub root: PathBuf,
}

impl SessionPaths {
    /// Resolve the session directory under `base`.
    ///
    /// If `base` already contains one or more `chat-{id}` components the
    /// path is truncated after the first (outermost) one.
    pub fn new(base: &Path, session_id: &str) -> Self {
        let expected = session_dir_name(session_id);
        let mut root = PathBuf::new();
        let mut found = false;
        for component in base.components() {
            root.push(component.as_os_str());
            if matches!(component, Component::Normal(name) if name == expected.as_str()) {
                found = true;
                break;
            }
        }
        if !found {
            root = base.join(&expected);
        } else if base.components().count() > root.components().count() {
            tracing::warn!(
                "nested session directory in {}, using {}",
                base.display(),
                root.display()
            );
        }
        Self {
            session_id: session_id.to_string(),
            root,
        }
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("_cache")
    }

    /// Scratch directory for the segments of the `ordinal`-th video of a
    /// job. The ordinal keeps equally named files from different folders
    /// apart.
    pub fn video_cache_dir(&self, ordinal: usize, video_name: &str) -> PathBuf {
        self.cache_dir().join(format!("{:03}_{}", ordinal, video_name))
    }

    /// Job files and worker logs.
    pub fn jobs_dir(&self) -> PathBuf {
        self.cache_dir().join("jobs")
    }

    pub fn intermediates_dir(&self) -> PathBuf {
        self.root.join("intermediates")
    }

    pub fn final_outputs_dir(&self) -> PathBuf {
        self.root.join("final_outputs")
    }

    pub fn vector_db_dir(&self) -> PathBuf {
        self.final_outputs_dir().join("vector_db")
    }

    pub fn graph_db_dir(&self) -> PathBuf {
        self.final_outputs_dir().join("graph_db")
    }

    /// Create the session directory (idempotent).
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
