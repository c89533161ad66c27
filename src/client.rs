//! KV client implementation
//!
//! The client registers the value (for `set`) or an empty receive buffer (for
//! `get`) with its own registry, sends a `Call` naming that region, and serves
//! the server's `BulkRead`/`BulkWrite` frames out of the registry until the
//! reply arrives.

use crate::connection::{spawn_writer, Outbox};
use crate::error::{KvError, Result};
use crate::memory::{BulkHandle, BulkRegistry, RegistryStats, ReleasedRegion};
use crate::protocol::{
    read_frame, validate_key, AccessMode, Address, Frame, RpcRequest, RpcResponse, Side, OP_EXISTS,
    OP_GET, OP_GET_SIZE, OP_SET,
};
use crate::server::PeerRecord;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long `forward` waits for a reply
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bytes the client may have registered for transfers at once
    pub registry_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            connect_timeout_ms: 5000,
            registry_capacity: 1024 * 1024 * 1024, // 1GB
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

type PendingCalls = DashMap<u64, oneshot::Sender<RpcResponse>>;

/// A live connection to one server
struct Link {
    address: Address,
    outbox: Outbox,
    pending: Arc<PendingCalls>,
    next_request: AtomicU64,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Waiters see their sender dropped.
        self.pending.clear();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Session with a KV server
pub struct KvClient {
    config: ClientConfig,
    registry: BulkRegistry,
    link: Mutex<Option<Arc<Link>>>,
    /// Serializes concurrent `connect` calls
    connecting: tokio::sync::Mutex<()>,
}

impl KvClient {
    pub fn new(config: ClientConfig) -> Self {
        let registry = BulkRegistry::new(Side::Client, config.registry_capacity);
        Self {
            config,
            registry,
            link: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect to `address` (`transport://host:port`).
    ///
    /// Succeeds without reconnecting when a connection is already live.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if let Some(current) = self.server_address().filter(|_| self.is_connected()) {
            tracing::debug!("Already connected to {}", current);
            return Ok(());
        }

        let address: Address = address.parse()?;
        tracing::info!("Connecting to server at {}", address);

        let candidates = address.resolve().await?;
        let stream = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&candidates[..]),
        )
        .await
        .map_err(|_| KvError::Connection(format!("timed out connecting to {}", address)))?
        .map_err(|e| KvError::Connection(format!("cannot connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (outbox, writer_task) = spawn_writer(writer);
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            reader,
            outbox.clone(),
            self.registry.clone(),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        let link = Arc::new(Link {
            address: address.clone(),
            outbox,
            pending,
            next_request: AtomicU64::new(1),
            closed,
            tasks: Mutex::new(vec![reader_task, writer_task]),
        });
        *self.link.lock() = Some(link);

        tracing::info!("Connected to {}", address);
        Ok(())
    }

    /// Drop the connection. Operations fail with `ConnectionError` until the
    /// next `connect`. Disconnecting twice is fine.
    pub fn disconnect(&self) -> Result<()> {
        if let Some(link) = self.link.lock().take() {
            tracing::info!("Disconnecting from {}", link.address);
            link.close();
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map_or(false, |link| !link.is_closed())
    }

    pub fn server_address(&self) -> Option<Address> {
        self.link.lock().as_ref().map(|link| link.address.clone())
    }

    /// Statistics of the client's bulk registry
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    fn live_link(&self) -> Result<Arc<Link>> {
        match self.link.lock().as_ref() {
            Some(link) if !link.is_closed() => Ok(Arc::clone(link)),
            Some(link) => Err(KvError::Connection(format!("connection to {} was lost", link.address))),
            None => Err(KvError::Connection("not connected".to_string())),
        }
    }

    /// Send one request naming `bulk` and wait up to `timeout` for its reply.
    ///
    /// On timeout the server is told to abandon the request; no retry is made.
    pub async fn forward(
        &self,
        operation: &str,
        key: &str,
        size: i32,
        bulk: &BulkHandle,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let link = self.live_link()?;
        let request_id = link.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        link.pending.insert(request_id, tx);

        let request = RpcRequest::new(operation, key, size, bulk.descriptor());
        if let Err(e) = link.outbox.send(Frame::Call { request_id, request }).await {
            link.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(KvError::Connection(format!(
                "connection to {} closed while waiting for {} reply",
                link.address, operation
            ))),
            Err(_) => {
                link.pending.remove(&request_id);
                tracing::warn!(
                    "{} timed out after {:?}, request_id={}",
                    operation,
                    timeout,
                    request_id
                );
                let _ = link.outbox.send(Frame::Cancel { request_id }).await;
                Err(KvError::Timeout(timeout))
            }
        }
    }

    /// Run `operation` against a freshly registered region and release it on every path.
    async fn call(
        &self,
        operation: &str,
        key: &str,
        region: BulkHandle,
    ) -> Result<ReleasedRegion> {
        let size = match wire_size(region.len()) {
            Ok(size) => size,
            Err(e) => {
                region.release();
                return Err(e);
            }
        };
        let result = self
            .forward(operation, key, size, &region, self.config.timeout())
            .await;
        let released = region.release();
        let response = result?;
        if !response.is_ok() {
            return Err(KvError::Remote {
                operation: operation.to_string(),
                status: response.ret,
            });
        }
        Ok(released)
    }

    /// Store `value` under `key`.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.live_link()?;
        validate_key(key)?;
        if value.is_empty() {
            return Err(KvError::Protocol("empty value".to_string()));
        }
        let region = self.registry.register(value.to_vec(), AccessMode::ReadOnly)?;
        self.call(OP_SET, key, region).await?;
        Ok(())
    }

    /// Fetch the value under `key` into a buffer of `max_size` bytes.
    ///
    /// Fails if the stored value is larger than `max_size`.
    pub async fn get(&self, key: &str, max_size: usize) -> Result<Vec<u8>> {
        self.live_link()?;
        validate_key(key)?;
        wire_size(max_size)?;
        let region = self.registry.allocate(max_size, AccessMode::WriteOnly)?;
        Ok(self.call(OP_GET, key, region).await?.into_written())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.live_link()?;
        validate_key(key)?;
        let region = self.registry.allocate(1, AccessMode::WriteOnly)?;
        let answer = self.call(OP_EXISTS, key, region).await?.into_written();
        match answer.as_slice() {
            [flag] => Ok(*flag != 0),
            _ => Err(KvError::Protocol("server sent no exists flag".to_string())),
        }
    }

    /// Length in bytes of the value stored under `key`.
    pub async fn value_size(&self, key: &str) -> Result<u64> {
        self.live_link()?;
        validate_key(key)?;
        let region = self.registry.allocate(8, AccessMode::WriteOnly)?;
        let answer = self.call(OP_GET_SIZE, key, region).await?.into_written();
        let bytes: [u8; 8] = answer
            .try_into()
            .map_err(|_| KvError::Protocol("server sent a short size".to_string()))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Fetch the whole value under `key`, asking for its size first.
    pub async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let size = self.value_size(key).await?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let size = usize::try_from(size)
            .map_err(|_| KvError::Protocol(format!("value of {} bytes is too large", size)))?;
        self.get(key, size).await
    }
}

fn wire_size(len: usize) -> Result<i32> {
    match i32::try_from(len) {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(KvError::Protocol(format!("size {} is not a valid request size", len))),
    }
}

/// Serve bulk frames and route replies until the server goes away.
async fn read_loop(
    mut reader: OwnedReadHalf,
    outbox: Outbox,
    registry: BulkRegistry,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Connection to server failed: {}", e);
                break;
            }
        };

        let reply = match frame {
            Frame::Reply { request_id, response } => {
                match pending.remove(&request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!("Late reply for request_id={}", request_id),
                }
                continue;
            }
            Frame::BulkRead {
                transfer_id,
                handle,
                offset,
                len,
            } => Frame::BulkData {
                transfer_id,
                result: registry.read(handle, offset, len).map_err(|e| e.to_string()),
            },
            Frame::BulkWrite {
                transfer_id,
                handle,
                offset,
                data,
            } => Frame::BulkAck {
                transfer_id,
                result: registry.write(handle, offset, &data).map_err(|e| e.to_string()),
            },
            other => {
                tracing::warn!("Unexpected {} frame from server", other.kind());
                continue;
            }
        };

        if outbox.send(reply).await.is_err() {
            break;
        }
    }

    closed.store(true, Ordering::Release);
    pending.clear();
}

/// Read the discovery records in `dir`. A missing directory holds no peers.
pub fn discover_peers(dir: impl AsRef<Path>) -> Result<Vec<PeerRecord>> {
    let dir = dir.as_ref();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut peers = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_peer_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with("peer_") && name.ends_with(".json"));
        if !is_peer_file {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(KvError::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<PeerRecord>(&bytes)?));
        match parsed {
            Ok(record) => peers.push(record),
            Err(e) => tracing::warn!("Skipping unreadable peer file {}: {}", path.display(), e),
        }
    }
    peers.sort_by_key(|peer| peer.provider_id);
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_operations_fail_when_disconnected() {
        let client = KvClient::new(ClientConfig::default());
        assert!(!client.is_connected());
        assert!(matches!(client.set("foo", b"bar").await, Err(KvError::Connection(_))));
        assert!(matches!(client.get("foo", 3).await, Err(KvError::Connection(_))));
        assert!(matches!(client.exists("foo").await, Err(KvError::Connection(_))));
        assert_eq!(client.registry_stats().live_handles, 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_addresses() {
        let client = KvClient::new(ClientConfig::default());
        for bad in ["not an address", "verbs://127.0.0.1:1234"] {
            assert!(matches!(client.connect(bad).await, Err(KvError::Connection(_))));
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = KvClient::new(ClientConfig::default());
        let result = client.connect(&format!("tcp://127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(KvError::Connection(_))));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let client = KvClient::new(ClientConfig::default());
        client.disconnect().unwrap();
        client.disconnect().unwrap();
        assert!(client.server_address().is_none());
    }

    #[test]
    fn test_wire_size_bounds() {
        assert_eq!(wire_size(3).unwrap(), 3);
        assert!(matches!(wire_size(0), Err(KvError::Protocol(_))));
        assert!(matches!(wire_size(i32::MAX as usize + 1), Err(KvError::Protocol(_))));
    }

    #[test]
    fn test_discover_peers() {
        let dir = TempDir::new().unwrap();
        assert!(discover_peers(dir.path().join("absent")).unwrap().is_empty());

        std::fs::write(
            dir.path().join("peer_42.json"),
            r#"{"addr": "tcp://127.0.0.1:1234", "provider_id": 42}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("peer_7.json"),
            r#"{"addr": "tcp://10.0.0.2:1234", "provider_id": 7}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("peer_bad.json"), "not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let peers = discover_peers(dir.path()).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].provider_id, 7);
        assert_eq!(peers[1].addr, "tcp://127.0.0.1:1234");
    }
}
