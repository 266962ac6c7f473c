//! Storage for run artifacts (timelines, KPI reports).

use super::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque reference to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub uri: String,
    pub media_type: String,
}

impl ArtifactHandle {
    fn new(run_id: &str, kind: &str, media_type: &str) -> Self {
        Self {
            uri: format!("artifact://{}/{}", run_id, kind),
            media_type: media_type.to_string(),
        }
    }

    /// `(run_id, kind)` encoded in the uri
    fn parts(&self) -> SimResult<(&str, &str)> {
        self.uri
            .strip_prefix("artifact://")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| SimError::Artifact(format!("malformed artifact handle '{}'", self.uri)))
    }
}

pub trait ArtifactStore: Send + Sync {
    fn store_artifact(&self, run_id: &str, kind: &str, payload: Vec<u8>, media_type: &str) -> SimResult<ArtifactHandle>;

    fn load_artifact(&self, handle: &ArtifactHandle) -> SimResult<Vec<u8>>;

    /// Drop a stored artifact; removing a missing one is not an error
    fn remove_artifact(&self, handle: &ArtifactHandle) -> SimResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn store_artifact(&self, run_id: &str, kind: &str, payload: Vec<u8>, media_type: &str) -> SimResult<ArtifactHandle> {
        let handle = ArtifactHandle::new(run_id, kind, media_type);
        self.artifacts
            .lock()
            .map_err(|_| SimError::Artifact("artifact store lock poisoned".to_string()))?
            .insert(handle.uri.clone(), payload);
        Ok(handle)
    }

    fn load_artifact(&self, handle: &ArtifactHandle) -> SimResult<Vec<u8>> {
        self.artifacts
            .lock()
            .map_err(|_| SimError::Artifact("artifact store lock poisoned".to_string()))?
            .get(&handle.uri)
            .cloned()
            .ok_or_else(|| SimError::Artifact(format!("no artifact at {}", handle.uri)))
    }

    fn remove_artifact(&self, handle: &ArtifactHandle) -> SimResult<()> {
        self.artifacts
            .lock()
            .map_err(|_| SimError::Artifact("artifact store lock poisoned".to_string()))?
            .remove(&handle.uri);
        Ok(())
    }
}

/// Stores each artifact at `root/<run_id>/<kind>`
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, run_id: &str, kind: &str) -> PathBuf {
        self.root.join(run_id).join(kind)
    }
}

impl ArtifactStore for FileArtifactStore {
    fn store_artifact(&self, run_id: &str, kind: &str, payload: Vec<u8>, media_type: &str) -> SimResult<ArtifactHandle> {
        let path = self.path_of(run_id, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, payload)?;
        log::debug!("stored {} ({})", path.display(), media_type);
        Ok(ArtifactHandle::new(run_id, kind, media_type))
    }

    fn load_artifact(&self, handle: &ArtifactHandle) -> SimResult<Vec<u8>> {
        let (run_id, kind) = handle.parts()?;
        Ok(fs::read(self.path_of(run_id, kind))?)
    }

    fn remove_artifact(&self, handle: &ArtifactHandle) -> SimResult<()> {
        let (run_id, kind) = handle.parts()?;
        match fs::remove_file(self.path_of(run_id, kind)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = InMemoryArtifactStore::new();
        let handle = store
            .store_artifact("run-1", "kpis.json", b"{}".to_vec(), "application/json")
            .unwrap();
        assert_eq!(handle.uri, "artifact://run-1/kpis.json");
        assert_eq!(store.load_artifact(&handle).unwrap(), b"{}".to_vec());
        assert_eq!(store.len(), 1);
        store.remove_artifact(&handle).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_artifact() {
        let store = InMemoryArtifactStore::new();
        let handle = ArtifactHandle::new("nope", "timeline.csv", "text/csv");
        assert!(matches!(store.load_artifact(&handle), Err(SimError::Artifact(_))));
    }

    #[test]
    fn test_file_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let handle = store
            .store_artifact("run-7", "timeline.csv", b"a,b\n".to_vec(), "text/csv")
            .unwrap();
        assert!(dir.path().join("run-7").join("timeline.csv").exists());
        assert_eq!(store.load_artifact(&handle).unwrap(), b"a,b\n".to_vec());

        store.remove_artifact(&handle).unwrap();
        assert!(!dir.path().join("run-7").join("timeline.csv").exists());
        // Already gone
        store.remove_artifact(&handle).unwrap();
    }

    #[test]
    fn test_malformed_handle() {
        let store = FileArtifactStore::new("/nonexistent");
        let handle = ArtifactHandle {
            uri: "s3://bucket/key".to_string(),
            media_type: "text/csv".to_string(),
        };
        assert!(store.load_artifact(&handle).is_err());
    }
}
