//! Resume Store: per-sync-key opaque resume tokens, durably snapshotted.
//!
//! Writers: the producer, once per event, and the periodic/shutdown snapshot
//! ticker. Readers: a producer at subscription time. See `fc-relay` for the
//! tasks that drive this.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;

/// In-memory `sync_key -> resume token bytes` map with durable JSON snapshotting.
pub struct ResumeStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl Default for ResumeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, token: Vec<u8>) {
        self.inner.write().insert(key.to_string(), token);
    }

    /// Serializes the whole map as `{sync_key: base64(token)}`.
    pub fn snapshot(&self) -> Vec<u8> {
        let encoded: HashMap<String, String> = self
            .inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), base64::Engine::encode(&base64::engine::general_purpose::STANDARD, v)))
            .collect();
        // A HashMap of strings serializes infallibly.
        serde_json::to_vec(&encoded).expect("snapshot serialization is infallible")
    }

    /// Parses a snapshot and replaces current state. Malformed input is a no-op;
    /// the caller is expected to log the returned error.
    pub fn load(&self, bytes: &[u8]) -> Result<(), LoadError> {
        let encoded: HashMap<String, String> =
            serde_json::from_slice(bytes).map_err(LoadError::Json)?;
        let mut decoded = HashMap::with_capacity(encoded.len());
        for (k, v) in encoded {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &v)
                .map_err(LoadError::Base64)?;
            decoded.insert(k, bytes);
        }
        *self.inner.write() = decoded;
        Ok(())
    }

    /// Atomically overwrites `path` with the current snapshot (write-temp-then-rename).
    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        let bytes = self.snapshot();
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Best-effort load from disk. A missing file is a cold start (no-op, no error).
    /// A corrupt file logs a warning and leaves state unchanged, per spec.
    pub fn load_from_file(&self, path: &Path) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read resume snapshot");
                return;
            }
        };
        if let Err(e) = self.load(&bytes) {
            tracing::warn!(error = %e, path = %path.display(), "failed to parse resume snapshot, starting cold");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid snapshot json: {0}")]
    Json(serde_json::Error),
    #[error("invalid base64 token: {0}")]
    Base64(base64::DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_unknown_key() {
        let store = ResumeStore::new();
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = ResumeStore::new();
        store.set("mongo|dst|a|b", vec![1, 2, 3]);
        assert_eq!(store.get("mongo|dst|a|b"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn snapshot_and_load_round_trip() {
        let store = ResumeStore::new();
        store.set("k1", vec![1, 2, 3]);
        store.set("k2", vec![4, 5]);

        let snapshot = store.snapshot();

        let restored = ResumeStore::new();
        restored.load(&snapshot).unwrap();
        assert_eq!(restored.get("k1"), Some(vec![1, 2, 3]));
        assert_eq!(restored.get("k2"), Some(vec![4, 5]));
    }

    #[test]
    fn load_with_malformed_input_leaves_state_unchanged() {
        let store = ResumeStore::new();
        store.set("k1", vec![9]);
        assert!(store.load(b"not json").is_err());
        assert_eq!(store.get("k1"), Some(vec![9]));
    }

    #[test]
    fn save_and_load_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_event_ids.json");

        let store = ResumeStore::new();
        store.set("k1", vec![7, 7, 7]);
        store.save_to_file(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let restored = ResumeStore::new();
        restored.load_from_file(&path);
        assert_eq!(restored.get("k1"), Some(vec![7, 7, 7]));
    }

    #[test]
    fn load_from_missing_file_is_cold_start_not_error() {
        let store = ResumeStore::new();
        store.load_from_file(Path::new("/nonexistent/path/last_event_ids.json"));
        assert_eq!(store.get("anything"), None);
    }
}
