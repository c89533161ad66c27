//! KV server implementation
//!
//! The server answers `Call` frames by dispatching them through its operation
//! table. Handlers drive the bulk step themselves: `set` pulls the value out of
//! the client's region, `get` pushes the stored value into it.

use crate::connection::spawn_writer;
use crate::dispatch::{CallContext, OperationTable};
use crate::error::{KvError, Result};
use crate::memory::BulkRegistry;
use crate::protocol::{
    read_frame, validate_key, validate_size, AccessMode, Address, BulkDescriptor, Frame,
    RpcRequest, RpcResponse, Side, OP_EXISTS, OP_GET, OP_GET_SIZE, OP_SET,
};
use crate::shutdown::{CancelToken, InflightTracker, ShutdownSignal};
use crate::storage::{open_backend, BackendConfig, StorageBackend};
use crate::transport::{BulkEndpoint, BulkReply, PeerEndpoint, TransferConfig, TransferEngine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `transport://host:port`; port 0 picks a free port
    pub listen_addr: String,
    pub backend: BackendConfig,
    /// Largest value accepted by `set` or returned by `get`
    pub max_value_size: usize,
    pub transfer: TransferConfig,
    /// Bytes the server may have registered for transfers at once
    pub registry_capacity: usize,
    /// How long shutdown waits for running handlers before cancelling them
    pub shutdown_grace_ms: u64,
    /// Directory for the `peer_<pid>.json` discovery file
    pub peer_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "tcp://127.0.0.1:1234".to_string(),
            backend: BackendConfig::default(),
            max_value_size: 128 * 1024 * 1024, // 128MB
            transfer: TransferConfig::default(),
            registry_capacity: 1024 * 1024 * 1024, // 1GB
            shutdown_grace_ms: 5000,
            peer_dir: None,
        }
    }
}

/// Discovery record written to the peer directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub addr: String,
    pub provider_id: u32,
}

/// The `set`/`get`/`exists`/`get_size` handlers
pub struct KvService {
    backend: Arc<dyn StorageBackend>,
    registry: BulkRegistry,
    engine: TransferEngine,
    max_value_size: usize,
}

impl KvService {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &ServerConfig) -> Self {
        Self {
            backend,
            registry: BulkRegistry::new(Side::Server, config.registry_capacity),
            engine: TransferEngine::new(config.transfer.clone()),
            max_value_size: config.max_value_size,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Regions the server currently has registered
    pub fn registry(&self) -> &BulkRegistry {
        &self.registry
    }

    /// Pull `size` bytes from the caller and store them under `key`.
    pub async fn handle_set(&self, peer: &dyn BulkEndpoint, request: &RpcRequest) -> Result<()> {
        validate_key(&request.key)?;
        let size = validate_size(request.size, self.max_value_size)?;

        let local = self.registry.allocate(size, AccessMode::WriteOnly)?;
        let pulled = self
            .engine
            .pull(peer, &request.bulk, &local, size as u64)
            .await;
        let region = local.release();
        pulled?;

        self.backend.put(&request.key, region.buffer).await
    }

    /// Push the value under `key` into the caller's region of `size` bytes.
    pub async fn handle_get(&self, peer: &dyn BulkEndpoint, request: &RpcRequest) -> Result<()> {
        validate_key(&request.key)?;
        let capacity = validate_size(request.size, self.max_value_size)?;

        let value = self.backend.get(&request.key).await?;
        if value.len() > capacity {
            return Err(KvError::Transfer(format!(
                "value of {} bytes does not fit the {} byte buffer",
                value.len(),
                capacity
            )));
        }
        self.push_bytes(peer, value, &request.bulk).await
    }

    /// Push `1` if `key` is stored, `0` otherwise.
    pub async fn handle_exists(&self, peer: &dyn BulkEndpoint, request: &RpcRequest) -> Result<()> {
        validate_key(&request.key)?;
        validate_size(request.size, self.max_value_size)?;

        let present = self.backend.exists(&request.key).await?;
        self.push_bytes(peer, vec![present as u8], &request.bulk).await
    }

    /// Push the stored length of `key` as a little-endian `u64`.
    pub async fn handle_get_size(&self, peer: &dyn BulkEndpoint, request: &RpcRequest) -> Result<()> {
        validate_key(&request.key)?;
        let capacity = validate_size(request.size, self.max_value_size)?;
        if capacity < 8 {
            return Err(KvError::Protocol(format!(
                "get_size needs an 8 byte buffer, got {}",
                capacity
            )));
        }

        let len = self.backend.size(&request.key).await?;
        self.push_bytes(peer, len.to_le_bytes().to_vec(), &request.bulk)
            .await
    }

    async fn push_bytes(
        &self,
        peer: &dyn BulkEndpoint,
        bytes: Vec<u8>,
        remote: &BulkDescriptor,
    ) -> Result<()> {
        let len = bytes.len() as u64;
        let local = self.registry.register(bytes, AccessMode::ReadOnly)?;
        let pushed = self.engine.push(peer, &local, remote, len).await;
        local.release();
        pushed.map(|_| ())
    }
}

/// Register the key/value operations on `table`.
pub fn register_kv_operations(table: &mut OperationTable, service: Arc<KvService>) -> Result<()> {
    let svc = Arc::clone(&service);
    table.register_operation(OP_SET, move |ctx: CallContext, req: RpcRequest| {
        let svc = Arc::clone(&svc);
        async move { svc.handle_set(ctx.peer.as_ref(), &req).await }
    })?;

    let svc = Arc::clone(&service);
    table.register_operation(OP_GET, move |ctx: CallContext, req: RpcRequest| {
        let svc = Arc::clone(&svc);
        async move { svc.handle_get(ctx.peer.as_ref(), &req).await }
    })?;

    let svc = Arc::clone(&service);
    table.register_operation(OP_EXISTS, move |ctx: CallContext, req: RpcRequest| {
        let svc = Arc::clone(&svc);
        async move { svc.handle_exists(ctx.peer.as_ref(), &req).await }
    })?;

    let svc = service;
    table.register_operation(OP_GET_SIZE, move |ctx: CallContext, req: RpcRequest| {
        let svc = Arc::clone(&svc);
        async move { svc.handle_get_size(ctx.peer.as_ref(), &req).await }
    })?;

    Ok(())
}

/// Process-wide server state shared by every connection
struct ServerState {
    operations: OperationTable,
    service: Arc<KvService>,
    shutdown: ShutdownSignal,
    inflight: InflightTracker,
    /// Set once shutdown starts; new calls are refused
    draining: AtomicBool,
}

/// KV server bound to its listen address
pub struct KvServer {
    config: ServerConfig,
    listener: TcpListener,
    address: Address,
    state: Arc<ServerState>,
    peer_file: Option<PathBuf>,
}

impl KvServer {
    /// Open the configured backend and bind the listen address.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let backend = open_backend(&config.backend).await?;
        Self::bind_with_backend(config, backend).await
    }

    /// Bind with an already opened backend.
    pub async fn bind_with_backend(
        config: ServerConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let requested: Address = config.listen_addr.parse()?;
        let candidates = requested.resolve().await?;
        let listener = TcpListener::bind(&candidates[..])
            .await
            .map_err(|e| KvError::Connection(format!("cannot listen on {}: {}", requested, e)))?;
        let local = listener.local_addr()?;
        let address = match requested.host.parse::<IpAddr>() {
            Ok(_) => Address::from_socket_addr(local),
            Err(_) => Address::tcp(requested.host.clone(), local.port()),
        };

        let service = Arc::new(KvService::new(backend, &config));
        let mut operations = OperationTable::new();
        register_kv_operations(&mut operations, Arc::clone(&service))?;

        let peer_file = match &config.peer_dir {
            Some(dir) => Some(write_peer_file(dir, &address)?),
            None => None,
        };

        tracing::info!(
            "KV server bound to {} ({} backend, operations: {:?})",
            address,
            service.backend().name(),
            operations.names()
        );

        Ok(Self {
            config,
            listener,
            address,
            state: Arc::new(ServerState {
                operations,
                service,
                shutdown: ShutdownSignal::new(),
                inflight: InflightTracker::new(),
                draining: AtomicBool::new(false),
            }),
            peer_file,
        })
    }

    /// Address clients should connect to
    pub fn local_address(&self) -> &Address {
        &self.address
    }

    pub fn service(&self) -> &Arc<KvService> {
        &self.state.service
    }

    pub fn peer_file(&self) -> Option<&Path> {
        self.peer_file.as_deref()
    }

    /// Serve connections until `shutdown` resolves, then drain and tear down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let KvServer {
            config,
            listener,
            address,
            state,
            peer_file,
        } = self;

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Accepted connection from {}", peer_addr);
                        connections.spawn(serve_connection(Arc::clone(&state), stream, peer_addr));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed on {}: {}", address, e);
                    }
                },
                // Reap finished connections so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!("Shutting down KV server on {}", address);
        drop(listener);
        state.draining.store(true, Ordering::SeqCst);

        let grace = Duration::from_millis(config.shutdown_grace_ms);
        if tokio::time::timeout(grace, state.inflight.wait_idle()).await.is_err() {
            tracing::warn!(
                "{} handlers still running after {:?}, cancelling",
                state.inflight.count(),
                grace
            );
        }
        state.shutdown.trigger();
        state.inflight.wait_idle().await;

        connections.abort_all();
        while connections.join_next().await.is_some() {}

        if let Err(e) = state.service.backend().close().await {
            tracing::error!("Failed to close storage backend: {}", e);
        }
        if let Some(path) = peer_file {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove peer file {}: {}", path.display(), e);
            }
        }

        tracing::info!("KV server stopped");
        Ok(())
    }
}

fn write_peer_file(dir: &Path, address: &Address) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let provider_id = std::process::id();
    let path = dir.join(format!("peer_{}.json", provider_id));
    let record = PeerRecord {
        addr: address.to_string(),
        provider_id,
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    tracing::info!("Wrote peer file {}", path.display());
    Ok(path)
}

async fn serve_connection(state: Arc<ServerState>, stream: TcpStream, peer_addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
    }
    let (mut reader, writer) = stream.into_split();
    let (outbox, _writer_task) = spawn_writer(writer);
    let peer = PeerEndpoint::new(outbox.clone());
    let endpoint: Arc<dyn BulkEndpoint> = Arc::new(peer.clone());
    let calls: Arc<DashMap<u64, CancelToken>> = Arc::new(DashMap::new());

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", peer_addr, e);
                break;
            }
        };

        match frame {
            Frame::Call { request_id, request } => {
                let guard = state.inflight.enter();
                if state.draining.load(Ordering::SeqCst) {
                    drop(guard);
                    tracing::debug!("Refusing {} during shutdown, request_id={}", request.operation, request_id);
                    let _ = outbox
                        .send(Frame::Reply {
                            request_id,
                            response: RpcResponse::failed(),
                        })
                        .await;
                    continue;
                }

                let cancel = state.shutdown.token();
                calls.insert(request_id, cancel.clone());
                let ctx = CallContext {
                    request_id,
                    peer: Arc::clone(&endpoint),
                    cancel,
                };
                let state = Arc::clone(&state);
                let outbox = outbox.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    let response = state.operations.dispatch(ctx, request).await;
                    calls.remove(&request_id);
                    if outbox.send(Frame::Reply { request_id, response }).await.is_err() {
                        tracing::debug!("Client left before reply, request_id={}", request_id);
                    }
                    drop(guard);
                });
            }
            Frame::Cancel { request_id } => {
                if let Some(token) = calls.get(&request_id) {
                    tracing::debug!("Client cancelled request_id={}", request_id);
                    token.cancel();
                }
            }
            Frame::BulkData { transfer_id, result } => {
                peer.complete(transfer_id, BulkReply::Data(result));
            }
            Frame::BulkAck { transfer_id, result } => {
                peer.complete(transfer_id, BulkReply::Ack(result));
            }
            other => {
                tracing::warn!("Unexpected {} frame from {}", other.kind(), peer_addr);
            }
        }
    }

    // The client is gone: nothing can reach its regions any more.
    peer.abandon_all();
    for call in calls.iter() {
        call.value().cancel();
    }
    tracing::debug!("Connection from {} closed", peer_addr);
}

/// Run the server until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let server = KvServer::bind(config).await?;

    tracing::info!("Starting KV server on {}", server.local_address());

    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received Ctrl-C"),
                Err(e) => {
                    tracing::error!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn service(config: &ServerConfig) -> KvService {
        KvService::new(Arc::new(MemoryBackend::new()), config)
    }

    fn request(operation: &str, key: &str, size: i32, bulk: BulkDescriptor) -> RpcRequest {
        RpcRequest::new(operation, key, size, bulk)
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"listen_addr": "tcp://0.0.0.0:0", "backend": {"kind": "memory"}, "transfer": {}}"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "tcp://0.0.0.0:0");
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.max_value_size, 128 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let svc = service(&ServerConfig::default());
        let client = BulkRegistry::new(Side::Client, 1024);

        let value = client.register(b"bar".to_vec(), AccessMode::ReadOnly).unwrap();
        svc.handle_set(&client, &request(OP_SET, "foo", 3, value.descriptor()))
            .await
            .unwrap();
        value.release();

        let sink = client.allocate(10, AccessMode::WriteOnly).unwrap();
        svc.handle_get(&client, &request(OP_GET, "foo", 10, sink.descriptor()))
            .await
            .unwrap();
        assert_eq!(sink.release().into_written(), b"bar");

        assert_eq!(svc.registry().stats().live_handles, 0);
    }

    #[tokio::test]
    async fn test_get_missing_key_skips_transfer() {
        let svc = service(&ServerConfig::default());
        let client = BulkRegistry::new(Side::Client, 1024);

        let sink = client.allocate(10, AccessMode::WriteOnly).unwrap();
        let err = svc
            .handle_get(&client, &request(OP_GET, "missing", 10, sink.descriptor()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(sink.release().written, 0);
    }

    #[tokio::test]
    async fn test_get_never_truncates() {
        let svc = service(&ServerConfig::default());
        svc.backend().put("big", vec![7u8; 64]).await.unwrap();
        let client = BulkRegistry::new(Side::Client, 1024);

        let sink = client.allocate(16, AccessMode::WriteOnly).unwrap();
        assert!(matches!(
            svc.handle_get(&client, &request(OP_GET, "big", 16, sink.descriptor())).await,
            Err(KvError::Transfer(_))
        ));
        assert_eq!(sink.release().written, 0);
        assert_eq!(svc.registry().stats().live_handles, 0);
    }

    #[tokio::test]
    async fn test_bad_requests_fail_before_registration() {
        let config = ServerConfig {
            registry_capacity: 0,
            ..Default::default()
        };
        let svc = service(&config);
        let client = BulkRegistry::new(Side::Client, 1024);
        let value = client.register(b"bar".to_vec(), AccessMode::ReadOnly).unwrap();

        for (key, size) in [("", 3), ("a/b", 3), ("ok", 0), ("ok", -1)] {
            let err = svc
                .handle_set(&client, &request(OP_SET, key, size, value.descriptor()))
                .await
                .unwrap_err();
            assert!(matches!(err, KvError::Protocol(_)), "{:?}/{}: {}", key, size, err);
        }

        // A valid request reaches registration, which fails on a zero-capacity registry.
        let err = svc
            .handle_set(&client, &request(OP_SET, "ok", 3, value.descriptor()))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Registration(_)));
        value.release();
    }

    #[tokio::test]
    async fn test_set_pull_failure_stores_nothing() {
        let svc = service(&ServerConfig::default());
        let client = BulkRegistry::new(Side::Client, 1024);

        // Declares more bytes than the client registered.
        let value = client.register(b"bar".to_vec(), AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            svc.handle_set(&client, &request(OP_SET, "foo", 5, value.descriptor())).await,
            Err(KvError::Transfer(_))
        ));
        value.release();

        assert!(!svc.backend().exists("foo").await.unwrap());
        assert_eq!(svc.registry().stats().live_handles, 0);
    }

    #[tokio::test]
    async fn test_exists_and_get_size() {
        let svc = service(&ServerConfig::default());
        svc.backend().put("foo", b"hello".to_vec()).await.unwrap();
        let client = BulkRegistry::new(Side::Client, 1024);

        let flag = client.allocate(1, AccessMode::WriteOnly).unwrap();
        svc.handle_exists(&client, &request(OP_EXISTS, "foo", 1, flag.descriptor()))
            .await
            .unwrap();
        assert_eq!(flag.release().into_written(), vec![1]);

        let flag = client.allocate(1, AccessMode::WriteOnly).unwrap();
        svc.handle_exists(&client, &request(OP_EXISTS, "nope", 1, flag.descriptor()))
            .await
            .unwrap();
        assert_eq!(flag.release().into_written(), vec![0]);

        let size = client.allocate(8, AccessMode::WriteOnly).unwrap();
        svc.handle_get_size(&client, &request(OP_GET_SIZE, "foo", 8, size.descriptor()))
            .await
            .unwrap();
        let bytes = size.release().into_written();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 5);

        let size = client.allocate(8, AccessMode::WriteOnly).unwrap();
        assert!(svc
            .handle_get_size(&client, &request(OP_GET_SIZE, "nope", 8, size.descriptor()))
            .await
            .unwrap_err()
            .is_not_found());
        size.release();
    }

    #[test]
    fn test_operations_register_once() {
        let svc = Arc::new(service(&ServerConfig::default()));
        let mut table = OperationTable::new();
        register_kv_operations(&mut table, Arc::clone(&svc)).unwrap();
        assert_eq!(table.names(), vec![OP_EXISTS, OP_GET, OP_GET_SIZE, OP_SET]);
        assert!(matches!(
            register_kv_operations(&mut table, svc),
            Err(KvError::DuplicateOperation(_))
        ));
    }
}
