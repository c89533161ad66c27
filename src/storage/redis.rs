//! Redis backend
//!
//! Values are stored as binary-safe Redis strings under the raw key.

use super::{StorageBackend, StorageFuture};
use crate::error::{KvError, Result};
use crate::protocol::validate_key;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

pub struct RedisBackend {
    /// Cloned per call; clones share one multiplexed socket.
    conn: MultiplexedConnection,
    url: String,
}

impl RedisBackend {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to redis at {}", url);
        Ok(Self { conn, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl StorageBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            validate_key(key)?;
            let mut conn = self.conn.clone();
            conn.set::<_, _, ()>(key, value).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_key(key)?;
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn.get(key).await?;
            value.ok_or_else(|| KvError::NotFound(key.to_string()))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            validate_key(key)?;
            let mut conn = self.conn.clone();
            Ok(conn.exists(key).await?)
        })
    }

    fn close(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!("Closing redis connection to {}", self.url);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_a_storage_error() {
        // Nothing listens on port 1.
        let result = RedisBackend::connect("127.0.0.1", 1).await;
        assert!(matches!(result, Err(KvError::Storage(_))));
    }
}
