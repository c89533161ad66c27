//! Storage backends
//!
//! The server owns exactly one backend, chosen at startup from
//! [`BackendConfig`]. Backends are shared by every in-flight handler and must
//! be safe for concurrent use.

pub mod fs;
pub mod memory;
pub mod redis;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

pub use self::fs::FsBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key/value persistence behind the `set`/`get` handlers
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `value` under `key`, replacing any previous value.
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StorageFuture<'a, ()>;

    /// Fetch the value under `key`; `KvError::NotFound` if absent.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>>;

    fn exists<'a>(&'a self, key: &'a str) -> StorageFuture<'a, bool>;

    /// Length in bytes of the value under `key`; `KvError::NotFound` if absent.
    fn size<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move { Ok(self.get(key).await?.len() as u64) })
    }

    /// Release connections or handles. Called once during shutdown.
    fn close(&self) -> StorageFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Backend selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// One file per key under `root`
    Filesystem { root: PathBuf },
    /// External Redis server
    Redis { host: String, port: u16 },
    /// Process-local map; contents are lost on exit
    Memory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            root: PathBuf::from("kv-data"),
        }
    }
}

/// Open the backend named by `config`.
pub async fn open_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config {
        BackendConfig::Filesystem { root } => Arc::new(FsBackend::open(root)?),
        BackendConfig::Redis { host, port } => Arc::new(RedisBackend::connect(host, *port).await?),
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
    };
    tracing::info!("Opened {} storage backend", backend.name());
    Ok(backend)
}
