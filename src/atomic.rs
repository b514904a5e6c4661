//! Crash-consistent file writes.
//!
//! Every status document and stage artifact goes through [`atomic_write`]:
//! the bytes land in a uniquely named sibling `.<name>.XXXXXX.tmp` first and
//! are then renamed over the destination. On POSIX filesystems the rename is
//! atomic, so a reader sees either the previous complete file or the new
//! complete file. Concurrent writers to one destination never share a
//! staging file; the last rename wins.
//!
//! Reads are forgiving: [`read_json_or_default`] treats a missing or corrupt
//! file as absent. A half-written file can only exist as a `.tmp` sibling.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::ffi::OsString;
use std::fmt::Debug;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::Result;

/// Payload accepted by the artifact store.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactContent {
    /// Structured record, written as pretty-printed JSON.
    Record(Value),
    /// UTF-8 text, written verbatim.
    Text(String),
    /// Opaque bytes, written verbatim.
    Binary(Vec<u8>),
}

impl ArtifactContent {
    /// Build a record from any serializable value, normalizing values that
    /// JSON cannot represent (see [`normalize`]).
    pub fn record<T: Serialize + Debug>(value: &T) -> Self {
        ArtifactContent::Record(normalize(value))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            ArtifactContent::Record(v) => serde_json::to_vec_pretty(v)?,
            ArtifactContent::Text(s) => s.clone().into_bytes(),
            ArtifactContent::Binary(b) => b.clone(),
        })
    }
}

/// Convert any serializable value into a JSON value without failing.
///
/// Maps and sequences convert structurally. When serde refuses a value
/// (non-string map keys, a `Serialize` impl that errors), the value is
/// stored as its `Debug` representation instead.
pub fn normalize<T: Serialize + Debug>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(_) => Value::String(format!("{:?}", value)),
    }
}

/// Suffix shared by every staging file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Open a fresh staging file next to `path`.
fn staging_file(path: &Path) -> io::Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut prefix = OsString::from(".");
    if let Some(name) = path.file_name() {
        prefix.push(name);
    }
    prefix.push(".");
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
}

/// Atomically replace `path` with `content`.
///
/// On failure the temporary file is removed, the error is returned, and the
/// destination keeps whatever it held before.
pub fn atomic_write(path: &Path, content: &ArtifactContent) -> Result<()> {
    write_with_hook(path, content, |_| Ok(()))
}

/// Serialize `value` and write it atomically.
pub fn write_json<T: Serialize + Debug>(path: &Path, value: &T) -> Result<()> {
    atomic_write(path, &ArtifactContent::record(value))
}

/// Same as [`atomic_write`], with a hook that runs after the temp file is
/// complete and before the rename. Tests use it to simulate a crash.
pub(crate) fn write_with_hook<F>(path: &Path, content: &ArtifactContent, before_rename: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let bytes = content.to_bytes()?;

    // Dropping `staged` on any early return removes the staging file.
    let mut staged = staging_file(path)?;
    staged.write_all(&bytes)?;
    staged.as_file().sync_all()?;
    before_rename(staged.path())?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read and deserialize a JSON file. `None` when missing or unparseable.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring corrupt JSON in {}: {}", path.display(), e);
            None
        }
    }
}

/// Read a JSON file, falling back to `T::default()` when missing or corrupt.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    read_json(path).unwrap_or_default()
}

/// Wall-clock time as fractional epoch seconds, as stored in status documents.
pub fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Local wall-clock time in RFC 3339, as stored in artifact envelopes.
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_and_read_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.json");
        atomic_write(&path, &ArtifactContent::Record(serde_json::json!({"a": 1}))).unwrap();
        let v: Value = read_json(&path).unwrap();
        assert_eq!(v, serde_json::json!({"a": 1}));
        assert_eq!(dir_entries(tmp.path()), vec!["a.json".to_string()]);
    }

    #[test]
    fn test_staging_file_is_a_hidden_sibling() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("status.json");
        let seen = std::cell::RefCell::new(PathBuf::new());
        write_with_hook(&path, &ArtifactContent::Text("x".into()), |staged| {
            *seen.borrow_mut() = staged.to_path_buf();
            Ok(())
        })
        .unwrap();

        let staged = seen.into_inner();
        assert_eq!(staged.parent(), Some(tmp.path()));
        let name = staged.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".status.json."), "{}", name);
        assert!(name.ends_with(TEMP_SUFFIX), "{}", name);
        assert!(!staged.exists());
    }

    #[test]
    fn test_failure_before_rename_keeps_original() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("status.json");
        atomic_write(&path, &ArtifactContent::Text("original".into())).unwrap();

        let result = write_with_hook(&path, &ArtifactContent::Text("replacement".into()), |_| {
            Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        assert_eq!(
            dir_entries(tmp.path()),
            vec!["status.json".to_string()],
            "temp file must be cleaned up"
        );
    }

    #[test]
    fn test_failure_on_fresh_target_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("new.bin");
        let result = write_with_hook(&path, &ArtifactContent::Binary(vec![1, 2, 3]), |_| {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        });
        assert!(result.is_err());
        assert!(dir_entries(tmp.path()).is_empty());
    }

    #[test]
    fn test_concurrent_writers_to_one_file() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("status.json"));
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = ["indexing", "query"]
            .into_iter()
            .map(|who| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut failures = 0;
                    for i in 0..300 {
                        let doc = serde_json::json!({ "writer": who, "seq": i });
                        if write_json(&path, &doc).is_err() {
                            failures += 1;
                        }
                    }
                    failures
                })
            })
            .collect();

        let reader = {
            let path = path.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut torn = 0;
                while !done.load(Ordering::Relaxed) {
                    if let Ok(raw) = fs::read(path.as_path()) {
                        if serde_json::from_slice::<Value>(&raw).is_err() {
                            torn += 1;
                        }
                    }
                    thread::sleep(Duration::from_micros(50));
                }
                torn
            })
        };

        let failures: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();
        done.store(true, Ordering::Relaxed);
        assert_eq!(failures, 0);
        assert_eq!(reader.join().unwrap(), 0);
        assert_eq!(dir_entries(tmp.path()), vec!["status.json".to_string()]);
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing.json");
        assert!(read_json::<Value>(&missing).is_none());

        let corrupt = tmp.path().join("corrupt.json");
        fs::write(&corrupt, "{\"a\": ").unwrap();
        let v: Vec<Value> = read_json_or_default(&corrupt);
        assert!(v.is_empty());
    }

    #[test]
    fn test_normalize_non_string_keys_falls_back_to_debug() {
        let mut map = BTreeMap::new();
        map.insert((1, 2), "pair");
        let v = normalize(&map);
        assert!(v.is_string());
        assert!(v.as_str().unwrap().contains("pair"));
    }

    #[test]
    fn test_normalize_nested_structures() {
        let data = vec![("k", vec![1, 2]), ("j", vec![])];
        let v = normalize(&data);
        assert_eq!(v, serde_json::json!([["k", [1, 2]], ["j", []]]));
    }
}
