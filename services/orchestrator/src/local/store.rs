//! JSON file state store for the local bindings.
//!
//! Holds provisioned machine records and applied-task markers so repeated
//! CLI invocations see the same cluster. Every mutation rewrites the whole
//! file through a temp file and rename; a crash leaves either the old or the
//! new state on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kubelab_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::provider::ProvisionedMachine;

/// State file name inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// A machine record plus the fingerprint of the spec it was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMachine {
    pub machine: ProvisionedMachine,
    pub spec_hash: SpecHash,
}

/// On-disk state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Machines by name.
    #[serde(default)]
    pub machines: BTreeMap<String, StoredMachine>,

    /// Applied-task markers: host -> task -> fingerprint.
    #[serde(default)]
    pub markers: BTreeMap<String, BTreeMap<String, SpecHash>>,
}

/// File-backed state store.
///
/// `update` holds a blocking mutex across the file write, so concurrent
/// creates and task applies from async callers are serialised on disk I/O.
/// The lock is never held across an `.await`.
pub struct LocalStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl LocalStore {
    /// Open or create the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(STATE_FILE);
        let state = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?
        } else {
            StoreState::default()
        };

        debug!(path = %path.display(), machines = state.machines.len(), "Opened state store");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<StoreState, StoreError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Poisoned)
    }

    /// Apply `f` to the state and persist the result.
    ///
    /// The in-memory state only changes if the write succeeds.
    pub fn update<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;

        let mut next = guard.clone();
        let result = f(&mut next);
        if next != *guard {
            self.persist(&next)?;
            *guard = next;
        }

        Ok(result)
    }

    /// Marker for `task` on `host`, if any.
    pub fn marker(&self, host: &str, task: &str) -> Result<Option<SpecHash>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(state.markers.get(host).and_then(|m| m.get(task)).cloned())
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        write_private(&temp_path, contents.as_bytes()).map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}
