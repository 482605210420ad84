//! Checkpoint keys
//!
//! A fingerprint identifies one (destination, source, local path) transfer.
//! Local paths are made absolute and lexically normalized first, so the same
//! transfer addressed through `./data/../out.bin` and `/home/u/out.bin`
//! shares one checkpoint.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Absolute, lexically normalized form of `path`
///
/// `.` components are dropped and `..` pops the previous component. Symlinks
/// are not resolved, so the path does not need to exist.
pub fn canonical_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Deterministic checkpoint key for a transfer
///
/// SHA-256 over the NUL-joined identities, hex encoded. `local_path` is
/// canonicalized before hashing.
pub fn fingerprint(
    destination: &str,
    source: &str,
    local_path: Option<&Path>,
) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(destination.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    if let Some(path) = local_path {
        hasher.update(canonical_path(path)?.as_os_str().as_encoded_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_and_absolute_paths_share_fingerprint() {
        let cwd = std::env::current_dir().unwrap();
        let relative = Path::new("downloads/./nested/../out.bin");
        let absolute = cwd.join("downloads").join("out.bin");

        assert_eq!(
            fingerprint("oss://b/k", "b/k", Some(relative)).unwrap(),
            fingerprint("oss://b/k", "b/k", Some(&absolute)).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let path = Path::new("/data/out.bin");
        let base = fingerprint("dst", "src", Some(path)).unwrap();

        assert_ne!(base, fingerprint("dst2", "src", Some(path)).unwrap());
        assert_ne!(base, fingerprint("dst", "src2", Some(path)).unwrap());
        assert_ne!(base, fingerprint("dst", "src", Some(Path::new("/data/other.bin"))).unwrap());
        assert_ne!(base, fingerprint("dst", "src", None).unwrap());
        // field boundaries matter
        assert_ne!(
            fingerprint("ab", "c", None).unwrap(),
            fingerprint("a", "bc", None).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint("d", "s", None).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint("d", "s", None).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_canonical_path() {
        assert_eq!(
            canonical_path(Path::new("/a/b/./c/../d")).unwrap(),
            PathBuf::from("/a/b/d")
        );
        assert_eq!(canonical_path(Path::new("/../x")).unwrap(), PathBuf::from("/x"));
    }
}
