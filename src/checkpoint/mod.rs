//! Checkpoint store
//!
//! Maps transfer fingerprints to [`TransferRecord`]s on top of a
//! [`CheckpointBackend`]. Malformed records are never surfaced as errors:
//! they are logged and reported as absent, so the caller starts over.
//! Storage failures do propagate.
//!
//! # Example
//!
//! ```no_run
//! use ossx::checkpoint::CheckpointStore;
//!
//! # fn main() -> ossx::Result<()> {
//! let store = CheckpointStore::in_directory("/var/lib/ossx/checkpoints")?;
//! let stale = store.prune_older_than(std::time::Duration::from_secs(7 * 24 * 3600))?;
//! println!("removed {} stale checkpoints", stale);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod fingerprint;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::record::TransferRecord;
use crate::error::{Result, TransferError};

pub use backend::{CheckpointBackend, DirectoryBackend, MemoryBackend};
pub use fingerprint::{canonical_path, fingerprint};

/// Durable fingerprint -> record mapping shared by all transfers
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    /// One record file per fingerprint under `dir`
    pub fn in_directory(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let backend = DirectoryBackend::new(&dir).map_err(|source| TransferError::Checkpoint {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Records live only as long as the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// `~/.ossx/checkpoints`
    pub fn default_location() -> Result<Self> {
        Self::in_directory(default_checkpoint_dir()?)
    }

    /// Load a record; corrupt or invalid records read as `None`
    pub fn get(&self, fingerprint: &str) -> Result<Option<TransferRecord>> {
        let bytes = match self.backend.get(fingerprint) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(source) => {
                return Err(TransferError::Checkpoint {
                    key: fingerprint.to_string(),
                    source,
                })
            }
        };

        let record: TransferRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(fingerprint, error = %e, "Ignoring unreadable checkpoint record");
                return Ok(None);
            }
        };

        if let Err(defect) = record.validate() {
            warn!(fingerprint, %defect, "Ignoring inconsistent checkpoint record");
            return Ok(None);
        }

        Ok(Some(record))
    }

    pub fn put(&self, fingerprint: &str, record: &TransferRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| TransferError::Checkpoint {
            key: fingerprint.to_string(),
            source: e.into(),
        })?;
        self.backend
            .put(fingerprint, &bytes)
            .map_err(|source| TransferError::Checkpoint {
                key: fingerprint.to_string(),
                source,
            })
    }

    /// Idempotent removal
    pub fn delete(&self, fingerprint: &str) -> Result<()> {
        self.backend
            .delete(fingerprint)
            .map_err(|source| TransferError::Checkpoint {
                key: fingerprint.to_string(),
                source,
            })
    }

    /// Whether a raw value exists, valid or not
    pub fn contains(&self, fingerprint: &str) -> Result<bool> {
        self.backend
            .get(fingerprint)
            .map(|value| value.is_some())
            .map_err(|source| TransferError::Checkpoint {
                key: fingerprint.to_string(),
                source,
            })
    }

    /// Remove records created more than `age` ago, and records that do not
    /// parse. Returns the number of records removed.
    pub fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| TransferError::InvalidConfig(format!("Prune age out of range: {}", e)))?;
        let cutoff = Utc::now() - age;

        let keys = self.backend.keys().map_err(|source| TransferError::Checkpoint {
            key: "*".to_string(),
            source,
        })?;

        let mut removed = 0;
        for key in keys {
            let stale = match self.get(&key)? {
                Some(record) => record.created_at < cutoff,
                None => true,
            };
            if stale {
                debug!(fingerprint = %key, "Pruning checkpoint record");
                self.delete(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Raw access for tooling and tests
    pub fn backend(&self) -> &Arc<dyn CheckpointBackend> {
        &self.backend
    }
}

fn default_checkpoint_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ossx").join("checkpoints"))
        .ok_or_else(|| {
            TransferError::InvalidConfig(
                "Cannot determine home directory for checkpoints".to_string(),
            )
        })
}

/// Whether `path` looks like a download staging file
pub fn is_temp_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(".tmp-"))
}
