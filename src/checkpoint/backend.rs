//! Persistence backends for the checkpoint store
//!
//! A backend is a byte-oriented key-value map. Keys are fingerprints (hex
//! strings), values are serialized records. Calls are short and synchronous;
//! they run inside the per-record critical section on the part completion path.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Durable key-value storage for checkpoint records
pub trait CheckpointBackend: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    fn put(&self, key: &str, value: &[u8]) -> io::Result<()>;

    /// Remove `key`; removing a missing key succeeds
    fn delete(&self, key: &str) -> io::Result<()>;

    fn keys(&self) -> io::Result<Vec<String>>;
}

const RECORD_EXTENSION: &str = "json";

/// One JSON file per key in a directory
///
/// Writes go to a uniquely named sibling file that is synced and renamed over
/// the target, so a crash leaves either the old or the new record.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    /// Open (and create if needed) a checkpoint directory
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(format!("{}.{}", key, RECORD_EXTENSION)))
    }
}

impl CheckpointBackend for DirectoryBackend {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let target = self.path_for(key)?;
        let staging = self
            .root
            .join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&staging)?;
            file.write_all(value)?;
            file.sync_data()?;
            fs::rename(&staging, &target)
        };

        write().inspect_err(|_| {
            let _ = fs::remove_file(&staging);
        })
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if check_key(stem).is_ok() {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Keys become file names; only a conservative alphabet is accepted
fn check_key(key: &str) -> io::Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid checkpoint key: {:?}", key),
        ))
    }
}

const SHARD_COUNT: usize = 16;

/// In-process backend, sharded so unrelated keys do not contend
#[derive(Debug)]
pub struct MemoryBackend {
    shards: Vec<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, Vec<u8>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointBackend for MemoryBackend {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let shard = self.shard(key).read().unwrap_or_else(PoisonError::into_inner);
        Ok(shard.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.shard(key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.shard(key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(backend: &dyn CheckpointBackend) {
        assert_eq!(backend.get("abc").unwrap(), None);

        backend.put("abc", b"one").unwrap();
        backend.put("abc", b"two").unwrap();
        backend.put("def", b"three").unwrap();
        assert_eq!(backend.get("abc").unwrap(), Some(b"two".to_vec()));
        assert_eq!(backend.keys().unwrap(), vec!["abc", "def"]);

        backend.delete("abc").unwrap();
        backend.delete("abc").unwrap();
        assert_eq!(backend.get("abc").unwrap(), None);
        assert_eq!(backend.keys().unwrap(), vec!["def"]);
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_directory_backend() {
        let dir = tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path().join("nested")).unwrap();
        exercise(&backend);

        // no staging files left behind
        let leftovers: Vec<_> = fs::read_dir(backend.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_directory_backend_rejects_traversal() {
        let dir = tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path()).unwrap();
        let err = backend.put("../escape", b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_directory_backend_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("bad key.json"), b"{}").unwrap();
        backend.put("k1", b"{}").unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["k1"]);
    }
}
