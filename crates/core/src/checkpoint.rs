use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn done(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Done,
            result: Some(result.into()),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Failed,
            result: None,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }
}

/// Durable per-item processing state backed by an append-only JSON-lines log.
///
/// Each `save` appends one line and fsyncs before returning, so a crash can
/// lose at most the entry being written; prior entries are untouched. Load
/// reads the whole log, later entries superseding earlier ones for the same
/// id, and tolerates a torn trailing line from an interrupted write.
pub struct CheckpointStore {
    path: PathBuf,
    log: File,
    entries: HashMap<String, CheckpointEntry>,
}

impl CheckpointStore {
    /// Open the log at `path`, creating it (and its parent directory) if
    /// missing. A missing file yields an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = load_entries(&path)?;
        let mut log = OpenOptions::new().create(true).append(true).open(&path)?;
        // A torn tail from a crashed append has no trailing newline; start
        // the next entry on a fresh line so it stays parseable.
        if !ends_with_newline(&path)? {
            log.write_all(b"\n")?;
        }
        Ok(Self { path, log, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<&CheckpointEntry> {
        self.entries.get(id)
    }

    pub fn is_done(&self, id: &str) -> bool {
        matches!(
            self.entries.get(id),
            Some(entry) if entry.status == ItemStatus::Done
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry and flush it to disk before returning.
    pub fn save(&mut self, entry: CheckpointEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.log.write_all(line.as_bytes())?;
        self.log.flush()?;
        self.log.sync_data()?;
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Rewrite the log with one line per id, dropping superseded entries.
    /// Uses write-then-rename so an interrupted compaction leaves the old
    /// log intact.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut ids: Vec<&String> = self.entries.keys().collect();
            ids.sort();
            for id in ids {
                let mut line = serde_json::to_string(&self.entries[id])?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.log = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn load_entries(path: &Path) -> Result<HashMap<String, CheckpointEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let mut entries = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) => {
                entries.insert(entry.id.clone(), entry);
            }
            Err(err) => {
                // Torn write from a crash mid-append; keep what parsed.
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    %err,
                    "skipping unreadable checkpoint line"
                );
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoint.jsonl")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_dir, store) = temp_store();
        assert!(store.is_empty());
        assert!(!store.is_done("anything"));
    }

    #[test]
    fn save_then_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let mut store = CheckpointStore::open(&path).unwrap();
        store
            .save(CheckpointEntry::done("vid_a", "summary of a"))
            .unwrap();
        store
            .save(CheckpointEntry::failed("vid_b", "token budget exceeded"))
            .unwrap();
        drop(store);

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.is_done("vid_a"));
        assert!(!store.is_done("vid_b"));
        assert_eq!(
            store.get("vid_a").unwrap().result.as_deref(),
            Some("summary of a")
        );
        assert_eq!(
            store.get("vid_b").unwrap().error.as_deref(),
            Some("token budget exceeded")
        );
    }

    #[test]
    fn later_entry_supersedes_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let mut store = CheckpointStore::open(&path).unwrap();
        store
            .save(CheckpointEntry::failed("vid_a", "transient"))
            .unwrap();
        store.save(CheckpointEntry::done("vid_a", "ok now")).unwrap();
        drop(store);

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.is_done("vid_a"));
    }

    #[test]
    fn torn_trailing_line_does_not_corrupt_prior_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let mut store = CheckpointStore::open(&path).unwrap();
        store.save(CheckpointEntry::done("vid_a", "kept")).unwrap();
        drop(store);

        // Simulate a crash between write and flush of the next entry.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\":\"vid_b\",\"status\":\"do").unwrap();
        drop(file);

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.is_done("vid_a"));
        assert_eq!(store.get("vid_a").unwrap().result.as_deref(), Some("kept"));
    }

    #[test]
    fn save_after_torn_tail_keeps_log_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"{\"id\":\"vid_a\",\"st").unwrap();
        drop(file);

        let mut store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.save(CheckpointEntry::done("vid_b", "fresh")).unwrap();
        drop(store);

        // The fresh entry starts on its own line despite the torn fragment.
        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_done("vid_b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn compact_keeps_latest_entry_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let mut store = CheckpointStore::open(&path).unwrap();
        store
            .save(CheckpointEntry::failed("vid_a", "first try"))
            .unwrap();
        store.save(CheckpointEntry::done("vid_a", "second")).unwrap();
        store.save(CheckpointEntry::done("vid_b", "b")).unwrap();
        store.compact().unwrap();

        let line_count = fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(line_count, 2);

        // The store stays usable after compaction.
        store.save(CheckpointEntry::done("vid_c", "c")).unwrap();
        drop(store);

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.is_done("vid_a"));
        assert!(store.is_done("vid_c"));
    }
}
