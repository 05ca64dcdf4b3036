//! Workflow state persistence
//!
//! A string-keyed store for run records and gate records. Keys are
//! namespaced paths:
//!
//! - `runs/<workflow_id>`: latest [`RunRecord`] of a workflow
//! - `gates/<workflow_id>/<gate_id>`: an [`ApprovalGate`](super::ApprovalGate)
//!
//! Saves are full overwrites and the last writer wins. Nothing here locks
//! across processes, so two concurrent resumes of the same workflow race.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::gate::GateRef;
use crate::{Error, Result};

const RUNS: &str = "runs";
const GATES: &str = "gates";

/// Persisted mirror of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run ID
    pub id: String,
    /// Workflow this run belongs to
    pub workflow_id: String,
    /// Pipeline source string
    pub pipeline: String,
    /// Stage the run is at (the gate stage when paused)
    pub stage_index: usize,
    /// Output of the last completed stage
    pub carried: Option<Vec<Value>>,
    /// Overall status
    pub status: RunStatus,
    /// Resume token (paused runs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Gate the run is waiting on (paused runs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateRef>,
    /// Failure description (failed runs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Currently executing stages
    Running,
    /// Stopped at an unapproved gate
    Paused,
    /// All stages finished
    Completed,
    /// A stage failed or a gate was rejected
    Failed,
}

impl RunRecord {
    /// Create a record for a fresh run
    pub fn new(workflow_id: &str, pipeline: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            pipeline: pipeline.to_string(),
            stage_index: 0,
            carried: None,
            status: RunStatus::Running,
            token: None,
            gate: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Record a pause at a gate
    pub fn pause(&mut self, stage_index: usize, token: String, gate: GateRef) {
        self.stage_index = stage_index;
        self.status = RunStatus::Paused;
        self.token = Some(token);
        self.gate = Some(gate);
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Record successful completion
    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.token = None;
        self.gate = None;
        self.updated_at = Utc::now();
    }

    /// Record a failure; failed runs are not resumable
    pub fn fail(&mut self, stage_index: Option<usize>, error: &str) {
        if let Some(index) = stage_index {
            self.stage_index = index;
        }
        self.status = RunStatus::Failed;
        self.token = None;
        self.gate = None;
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Workflow: {} (run {})", self.workflow_id, self.id),
            format!("Status: {:?}", self.status),
            format!("Stage: {}", self.stage_index),
            format!("Pipeline: {}", self.pipeline),
        ];
        if let Some(gate) = &self.gate {
            lines.push(format!("Waiting on gate: {}", gate.gate_id));
        }
        if let Some(error) = &self.error {
            lines.push(format!("Error: {}", error));
        }
        lines.push(format!(
            "Updated: {}",
            self.updated_at.format("%Y-%m-%d %H:%M:%S")
        ));
        lines.join("\n")
    }
}

/// Validate an identifier used as part of a state key
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid {} '{}': use letters, digits, '.', '_' or '-'",
            kind, id
        )))
    }
}

/// Key of a workflow's run record
pub fn run_key(workflow_id: &str) -> Result<String> {
    validate_id("workflow id", workflow_id)?;
    Ok(format!("{}/{}", RUNS, workflow_id))
}

/// Key of a gate record
pub fn gate_key(workflow_id: &str, gate_id: &str) -> Result<String> {
    validate_id("workflow id", workflow_id)?;
    validate_id("gate id", gate_id)?;
    Ok(format!("{}/{}/{}", GATES, workflow_id, gate_id))
}

/// Namespace holding all gates of a workflow
pub fn gate_namespace(workflow_id: &str) -> Result<String> {
    validate_id("workflow id", workflow_id)?;
    Ok(format!("{}/{}", GATES, workflow_id))
}

/// Raw byte storage keyed by string
pub trait StateBackend: Send + Sync {
    /// Read the bytes stored at `key`
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the bytes stored at `key`
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Check whether `key` holds a value
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete `key`; returns whether anything was removed
    fn remove(&self, key: &str) -> Result<bool>;

    /// Keys directly inside `namespace`, sorted
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// One JSON file per key under a base directory
pub struct FileBackend {
    base_dir: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

impl StateBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so readers never see a half-written file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!("Saved state {:?}", path);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.base_dir.join(namespace);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    keys.push(format!("{}/{}", namespace, stem.to_string_lossy()));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::State("memory store lock poisoned".to_string()))
    }
}

impl StateBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.contains_key(key))
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", namespace);
        Ok(self
            .entries()?
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix)
                    .map(|rest| !rest.contains('/'))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// Typed access to run and gate state
#[derive(Clone)]
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
}

impl StateManager {
    /// Create a state manager over any backend
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// File-backed state under `base_dir`
    pub fn file(base_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(base_dir)))
    }

    /// Volatile in-memory state
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Load the value at `key`, failing with `NotFound` if absent
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.try_load(key)?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Load the value at `key` if present
    pub fn try_load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.read(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::State(format!("Corrupt state at {}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Overwrite the value at `key`
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.backend.write(key, &bytes)
    }

    /// Check whether `key` holds a value
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key)
    }

    /// Delete the value at `key`; returns whether anything was removed
    pub fn reset(&self, key: &str) -> Result<bool> {
        self.backend.remove(key)
    }

    /// Keys directly inside `namespace`
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.backend.keys(namespace)
    }

    /// Load a workflow's run record
    pub fn load_run(&self, workflow_id: &str) -> Result<RunRecord> {
        self.load(&run_key(workflow_id)?)
    }

    /// Save a run record under its workflow id
    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        self.save(&run_key(&record.workflow_id)?, record)
    }

    /// Delete a workflow's run record
    pub fn reset_run(&self, workflow_id: &str) -> Result<bool> {
        self.reset(&run_key(workflow_id)?)
    }

    /// All run records, most recently updated first
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for key in self.keys(RUNS)? {
            if let Some(record) = self.try_load::<RunRecord>(&key)? {
                runs.push(record);
            }
        }
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }
}
