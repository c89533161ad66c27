//! In-process backend

use super::{StorageBackend, StorageFuture};
use crate::error::KvError;
use crate::protocol::validate_key;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            validate_key(key)?;
            self.values.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_key(key)?;
            self.values
                .get(key)
                .map(|v| v.clone())
                .ok_or_else(|| KvError::NotFound(key.to_string()))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            validate_key(key)?;
            Ok(self.values.contains_key(key))
        })
    }

    fn size<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            validate_key(key)?;
            self.values
                .get(key)
                .map(|v| v.len() as u64)
                .ok_or_else(|| KvError::NotFound(key.to_string()))
        })
    }

    fn close(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!("Dropping {} in-memory values", self.values.len());
            self.values.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemoryBackend::new();
        store.put("k", b"one".to_vec()).await.unwrap();
        store.put("k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"two");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_every_method_validates_keys() {
        let store = MemoryBackend::new();
        for key in ["", "a/b", ".."] {
            assert!(matches!(store.put(key, b"v".to_vec()).await, Err(KvError::Protocol(_))));
            assert!(matches!(store.get(key).await, Err(KvError::Protocol(_))));
            assert!(matches!(store.exists(key).await, Err(KvError::Protocol(_))));
            assert!(matches!(store.size(key).await, Err(KvError::Protocol(_))));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_close_drops_values() {
        let store = MemoryBackend::new();
        store.put("k", b"v".to_vec()).await.unwrap();
        store.close().await.unwrap();
        assert!(store.is_empty());
        assert!(!store.exists("k").await.unwrap());
    }
}
