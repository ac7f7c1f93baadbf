//! Persistence of workflow IDs across process restarts.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use crate::session::SessionKey;

/// Lookup and persistence seam for the session-key -> workflow-ID mapping.
///
/// The session registry reads on session creation and writes when the
/// service hands back a freshly created workflow ID.
pub trait WorkflowIdStore: Send + Sync {
    fn load(&self, key: &SessionKey) -> Option<String>;
    fn save(&self, key: &SessionKey, workflow_id: &str);
}

/// Per-user JSON file store.
///
/// Every failure mode is non-fatal: a missing file reads as empty, corrupt
/// JSON reads as empty with a warning, and write failures only warn. Losing
/// the mapping costs a workflow resume, never a session.
pub struct FileWorkflowIdStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWorkflowIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> HashMap<String, String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "workflow id store is corrupt, starting empty");
                HashMap::new()
            }
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "could not create workflow id store directory");
                return;
            }
        }
        let json = match serde_json::to_string_pretty(map) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "could not serialize workflow id store");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %err, "could not write workflow id store");
        }
    }
}

impl WorkflowIdStore for FileWorkflowIdStore {
    fn load(&self, key: &SessionKey) -> Option<String> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.read_map().get(&key.storage_key()).cloned()
    }

    fn save(&self, key: &SessionKey, workflow_id: &str) {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut map = self.read_map();
        map.insert(key.storage_key(), workflow_id.to_string());
        self.write_map(&map);
    }
}

/// In-memory store for tests and hosts that opt out of persistence.
#[derive(Default)]
pub struct MemoryWorkflowIdStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryWorkflowIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowIdStore for MemoryWorkflowIdStore {
    fn load(&self, key: &SessionKey) -> Option<String> {
        self.map
            .lock()
            .expect("store lock poisoned")
            .get(&key.storage_key())
            .cloned()
    }

    fn save(&self, key: &SessionKey, workflow_id: &str) {
        self.map
            .lock()
            .expect("store lock poisoned")
            .insert(key.storage_key(), workflow_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(session: &str) -> SessionKey {
        SessionKey::new("https://gitlab.example.com", "duo-agent", session)
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowIdStore::new(dir.path().join("missing.json"));
        assert_eq!(store.load(&key("s1")), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowIdStore::new(dir.path().join("nested/dir/ids.json"));
        store.save(&key("s1"), "wf-123");
        assert_eq!(store.load(&key("s1")).as_deref(), Some("wf-123"));

        // A second instance re-reads from disk.
        let store = FileWorkflowIdStore::new(dir.path().join("nested/dir/ids.json"));
        assert_eq!(store.load(&key("s1")).as_deref(), Some("wf-123"));
        assert_eq!(store.load(&key("s2")), None);
    }

    #[test]
    fn corrupt_file_reads_as_empty_and_recovers_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        fs::write(&path, "{{{ not json").unwrap();
        let store = FileWorkflowIdStore::new(&path);
        assert_eq!(store.load(&key("s1")), None);
        store.save(&key("s1"), "wf-9");
        assert_eq!(store.load(&key("s1")).as_deref(), Some("wf-9"));
    }

    #[test]
    fn keys_are_distinct_per_session_triple() {
        let store = MemoryWorkflowIdStore::new();
        store.save(&key("a"), "wf-1");
        store.save(&key("b"), "wf-2");
        assert_eq!(store.load(&key("a")).as_deref(), Some("wf-1"));
        assert_eq!(store.load(&key("b")).as_deref(), Some("wf-2"));
    }
}
