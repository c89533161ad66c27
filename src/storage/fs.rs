//! Filesystem backend: one file per key
//!
//! Writes go to a temporary file in a staging directory under the same root and
//! are renamed into place, so readers see either the old or the new value.

use super::{StorageBackend, StorageFuture};
use crate::error::{KvError, Result};
use crate::protocol::validate_key;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Staging directory for in-progress writes, relative to the root
const STAGING_DIR: &str = ".partial";

#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    staging: PathBuf,
}

impl FsBackend {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging).map_err(|e| {
            KvError::Storage(format!("cannot create store at {}: {}", root.display(), e))
        })?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        if key == STAGING_DIR {
            return Err(KvError::Protocol(format!("key {:?} is reserved", key)));
        }
        Ok(self.root.join(key))
    }
}

fn map_io(key: &str, path: &Path, e: std::io::Error) -> KvError {
    match e.kind() {
        ErrorKind::NotFound => KvError::NotFound(key.to_string()),
        _ => KvError::Storage(format!("{}: {}", path.display(), e)),
    }
}

fn write_atomic(staging: &Path, path: &Path, value: &[u8]) -> Result<()> {
    let storage = |e: std::io::Error| KvError::Storage(format!("{}: {}", path.display(), e));

    let mut tmp = tempfile::NamedTempFile::new_in(staging).map_err(storage)?;
    tmp.write_all(value).map_err(storage)?;
    tmp.as_file().sync_all().map_err(storage)?;
    // On failure the temp file is removed when `tmp` drops.
    tmp.persist(path).map_err(|e| storage(e.error))?;
    Ok(())
}

impl StorageBackend for FsBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let staging = self.staging.clone();
            tokio::task::spawn_blocking(move || write_atomic(&staging, &path, &value))
                .await
                .map_err(|e| KvError::Storage(format!("write task failed: {}", e)))?
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            tokio::fs::read(&path).await.map_err(|e| map_io(key, &path, e))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(map_io(key, &path, e)),
            }
        })
    }

    fn size<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| map_io(key, &path, e))?;
            if !meta.is_file() {
                return Err(KvError::NotFound(key.to_string()));
            }
            Ok(meta.len())
        })
    }
}
