//! Directory-backed, content-addressed patch store.
//!
//! Entry layout:
//! ```text
//! <root>/<prefix>/<name>.<sourceHex>.<targetHex>.diff
//! ```
//! The store is a pure key -> value map over that hierarchy: lookups read
//! bytes, stores write bytes. Checksum verification of payloads is the
//! engine's job, which keeps the repository testable in isolation.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::model::{PatchKey, PatchRecord};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// An entry already exists for this key with different payload bytes.
    /// Patches are immutable once produced; a divergent rebuild must be
    /// caught, never silently overwritten.
    #[error("patch entry already exists with different content: {path}")]
    Conflict { path: PathBuf },
    #[error("failed to access patch entry {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read path is used during installation and is safe for unlimited
/// concurrent readers; the write path is authoring-only and serializes
/// per key via an advisory lock file.
pub struct PatchRepository {
    root: PathBuf,
}

impl PatchRepository {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic storage address for a key.
    pub fn entry_path(&self, key: &PatchKey) -> PathBuf {
        let dir = if key.identity.prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&key.identity.prefix)
        };
        dir.join(format!(
            "{}.{}.{}.diff",
            key.identity.name,
            key.source.digest_hex(),
            key.target.digest_hex()
        ))
    }

    /// Resolve a key to its record. A missing entry is a normal outcome
    /// (most files in a large tree have no patch), reported as `None`.
    /// A zero-length entry is a known source with a deliberately omitted
    /// diff: the record exists but carries no payload.
    pub fn lookup(&self, key: &PatchKey) -> Result<Option<PatchRecord>, RepoError> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!(entry = %path.display(), len = bytes.len(), "repository hit");
                Ok(Some(PatchRecord {
                    metadata: key.source.clone(),
                    data: if bytes.is_empty() { None } else { Some(bytes) },
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(entry = %path.display(), "repository miss");
                Ok(None)
            }
            Err(source) => Err(RepoError::Io { path, source }),
        }
    }

    /// Persist a record (authoring mode). Idempotent for identical bytes;
    /// a rewrite with different bytes fails with [`RepoError::Conflict`].
    ///
    /// Concurrent stores of the same key are serialized by an exclusive
    /// lock scoped to that key's address, so builds of different files
    /// never contend.
    pub fn store(&self, key: &PatchKey, record: &PatchRecord) -> Result<(), RepoError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RepoError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = lock_path_for(&path);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| RepoError::Io {
                path: lock_path.clone(),
                source,
            })?;
        lock_file.lock_exclusive().map_err(|source| RepoError::Io {
            path: lock_path.clone(),
            source,
        })?;

        let result = self.store_locked(&path, record);

        // Advisory lock is released on drop; the lock file itself stays
        // behind and is reused by the next store of this key.
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn store_locked(&self, path: &Path, record: &PatchRecord) -> Result<(), RepoError> {
        let new_bytes: &[u8] = record.data.as_deref().unwrap_or(&[]);

        match std::fs::read(path) {
            Ok(existing) => {
                if existing == new_bytes {
                    debug!(entry = %path.display(), "store is idempotent, entry unchanged");
                    return Ok(());
                }
                return Err(RepoError::Conflict {
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RepoError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let mut file = std::fs::File::create(path).map_err(|source| RepoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        file.write_all(new_bytes)
            .and_then(|_| file.flush())
            .map_err(|source| RepoError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(entry = %path.display(), len = new_bytes.len(), "stored patch entry");
        Ok(())
    }
}

fn lock_path_for(entry: &Path) -> PathBuf {
    let mut name = entry
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    entry.with_file_name(name)
}
