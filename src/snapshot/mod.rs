//! On-disk store of rendered terminal state, one JSON file per session id.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const MAX_SNAPSHOT_BYTES: u64 = 8 * 1024 * 1024;
pub const MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;

const EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSnapshot {
    pub version: u32,
    pub created_at: String,
    pub cols: u16,
    pub rows: u16,
    /// The terminal widget's own serialized screen state.
    pub data: String,
}

impl TerminalSnapshot {
    pub fn new(cols: u16, rows: u16, data: String) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            cols,
            rows,
            data,
        }
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
    max_snapshot_bytes: u64,
    max_total_bytes: u64,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        Self::with_limits(dir, MAX_SNAPSHOT_BYTES, MAX_TOTAL_BYTES)
    }

    pub fn with_limits(
        dir: impl Into<PathBuf>,
        max_snapshot_bytes: u64,
        max_total_bytes: u64,
    ) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_snapshot_bytes,
            max_total_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `snapshot` under `id`, replacing any previous one.
    ///
    /// Oversized snapshots are dropped without touching disk.
    pub fn save(&self, id: &str, snapshot: &TerminalSnapshot) -> Result<(), SnapshotError> {
        let text = serde_json::to_string(snapshot)?;
        if text.len() as u64 > self.max_snapshot_bytes {
            debug!(%id, bytes = text.len(), "snapshot over size limit; skipped");
            return Ok(());
        }

        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text.as_bytes())?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.prune();
        Ok(())
    }

    /// Missing, unreadable and foreign-version snapshots all read as absent.
    pub fn get(&self, id: &str) -> Option<TerminalSnapshot> {
        let path = self.path_for(id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(%id, error = %e, "snapshot unreadable");
                return None;
            }
        };
        match serde_json::from_str::<TerminalSnapshot>(&text) {
            Ok(s) if s.version == SNAPSHOT_VERSION => Some(s),
            Ok(s) => {
                debug!(%id, version = s.version, "snapshot version mismatch");
                None
            }
            Err(e) => {
                debug!(%id, error = %e, "snapshot unparsable");
                None
            }
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), SnapshotError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// File for `id`. Anything outside `[A-Za-z0-9_-]` becomes `_`, so the id
    /// can never leave the store directory. Distinct ids may collide.
    pub fn path_for(&self, id: &str) -> PathBuf {
        let name: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    /// Total bytes of stored snapshots.
    pub fn total_bytes(&self) -> u64 {
        self.entries()
            .map(|entries| entries.iter().map(|e| e.size).sum())
            .unwrap_or(0)
    }

    /// Delete the least recently modified snapshots until the total fits.
    /// Failures are logged and otherwise ignored.
    fn prune(&self) {
        let mut entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "snapshot prune skipped");
                return;
            }
        };
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_total_bytes {
            return;
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        for entry in entries {
            if total <= self.max_total_bytes {
                break;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => debug!(path = %entry.path.display(), "pruned snapshot"),
                Err(e) => debug!(path = %entry.path.display(), error = %e, "snapshot prune failed"),
            }
            total = total.saturating_sub(entry.size);
        }
    }

    fn entries(&self) -> io::Result<Vec<Entry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            out.push(Entry {
                path,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(out)
    }
}

struct Entry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(data: &str) -> TerminalSnapshot {
        TerminalSnapshot::new(120, 30, data.to_string())
    }

    fn set_mtime(path: &Path, ago_secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(ago_secs))
            .unwrap();
    }

    #[test]
    fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let snap = snapshot("\x1b[1mhello\x1b[0m\r\n$ ");

        store.save("task-1", &snap).unwrap();
        assert_eq!(store.get("task-1"), Some(snap));
        assert_eq!(store.get("task-2"), None);
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save("t", &snapshot("old")).unwrap();
        store.save("t", &snapshot("new")).unwrap();
        assert_eq!(store.get("t").unwrap().data, "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn oversized_snapshot_is_dropped_and_disk_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_limits(dir.path(), 512, MAX_TOTAL_BYTES).unwrap();
        let small = snapshot("small");
        store.save("t", &small).unwrap();
        let before = store.total_bytes();

        store.save("t", &snapshot(&"x".repeat(1024))).unwrap();
        store.save("other", &snapshot(&"x".repeat(1024))).unwrap();

        assert_eq!(store.total_bytes(), before);
        assert_eq!(store.get("t"), Some(small));
        assert_eq!(store.get("other"), None);
    }

    #[test]
    fn prune_evicts_least_recently_modified_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_limits(dir.path(), 10_000, 2_500).unwrap();
        let payload = "x".repeat(1_000);

        store.save("a", &snapshot(&payload)).unwrap();
        set_mtime(&store.path_for("a"), 300);
        store.save("b", &snapshot(&payload)).unwrap();
        set_mtime(&store.path_for("b"), 200);
        store.save("c", &snapshot(&payload)).unwrap();

        assert_eq!(store.get("a"), None);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
        assert!(store.total_bytes() <= 2_500);
    }

    #[test]
    fn prune_ignores_files_that_are_not_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_limits(dir.path(), 10_000, 1_500).unwrap();
        let notes = dir.path().join("notes.txt");
        fs::write(&notes, "y".repeat(5_000)).unwrap();

        store.save("a", &snapshot(&"x".repeat(1_000))).unwrap();
        assert!(store.get("a").is_some());
        assert!(notes.exists());
    }

    #[test]
    fn hostile_id_stays_inside_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let id = "task/../../etc";

        let path = store.path_for(id);
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(path.file_name().unwrap(), "task_______etc.json");

        store.save(id, &snapshot("x")).unwrap();
        assert!(store.get(id).is_some());
        store.delete(id).unwrap();
        assert_eq!(store.get(id), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn other_versions_and_garbage_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut old = snapshot("x");
        old.version = 2;
        store.save("v2", &old).unwrap();
        fs::write(store.path_for("junk"), "{ not json").unwrap();

        assert_eq!(store.get("v2"), None);
        assert_eq!(store.get("junk"), None);
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.delete("never-saved").unwrap();
    }

    #[test]
    fn snapshot_json_uses_camel_case_fields() {
        let value = serde_json::to_value(snapshot("d")).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["createdAt"].is_string());
        assert_eq!(value["cols"], 120);
    }
}
