//! Integration tests for the bulk KV service

use kv_bulk::client::{discover_peers, ClientConfig, KvClient};
use kv_bulk::error::KvError;
use kv_bulk::server::{KvServer, ServerConfig};
use kv_bulk::storage::{BackendConfig, FsBackend, MemoryBackend, StorageBackend, StorageFuture};
use kv_bulk::transport::TransferConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kv_bulk=debug")
        .try_init();
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "tcp://127.0.0.1:0".to_string(),
        backend: BackendConfig::Memory,
        ..Default::default()
    }
}

/// A server running in the test process
struct TestServer {
    address: String,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<kv_bulk::Result<()>>,
}

impl TestServer {
    async fn start(config: ServerConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let server = KvServer::bind_with_backend(config, backend).await.unwrap();
        let address = server.local_address().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Self {
            address,
            stop,
            handle,
        }
    }

    async fn memory() -> Self {
        Self::start(test_config(), Arc::new(MemoryBackend::new())).await
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn connected_client(address: &str) -> KvClient {
    let client = KvClient::new(ClientConfig::default());
    client.connect(address).await.unwrap();
    client
}

/// Memory backend whose writes take `delay`
struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl StorageBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, value).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        self.inner.get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StorageFuture<'a, bool> {
        self.inner.exists(key)
    }
}

#[tokio::test]
async fn test_filesystem_example_scenario() {
    init_tracing();

    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FsBackend::open(dir.path()).unwrap());
    assert_eq!(backend.root(), dir.path());
    let config = ServerConfig {
        backend: BackendConfig::Filesystem {
            root: dir.path().to_path_buf(),
        },
        ..test_config()
    };
    let server = TestServer::start(config, backend).await;
    let client = connected_client(&server.address).await;

    client.set("foo", b"bar").await.unwrap();
    assert_eq!(client.get("foo", 3).await.unwrap(), b"bar");
    assert_eq!(std::fs::read(dir.path().join("foo")).unwrap(), b"bar");

    let err = client.get("missing", 10).await.unwrap_err();
    assert!(matches!(err, KvError::Remote { .. }));
    assert_eq!(err.status(), -1);

    // Every handle was released on both sides.
    assert_eq!(client.registry_stats().live_handles, 0);

    client.disconnect().unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_opens_configured_backend() {
    init_tracing();

    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        backend: BackendConfig::Filesystem {
            root: dir.path().join("data"),
        },
        ..test_config()
    };
    let server = KvServer::bind(config).await.unwrap();
    assert_eq!(server.service().backend().name(), "filesystem");
    assert_ne!(server.local_address().port, 0);
    assert!(server.peer_file().is_none());
    assert!(dir.path().join("data").is_dir());
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    init_tracing();
    let server = TestServer::memory().await;

    let client = Arc::new(KvClient::new(ClientConfig::default()));
    client.connect(&server.address).await.unwrap();
    let first = client.server_address().unwrap();
    client.connect(&server.address).await.unwrap();
    assert_eq!(client.server_address().unwrap(), first);

    // Racing connects on a fresh client both succeed.
    let fresh = Arc::new(KvClient::new(ClientConfig::default()));
    let (a, b) = tokio::join!(fresh.connect(&server.address), fresh.connect(&server.address));
    a.unwrap();
    b.unwrap();
    assert!(fresh.is_connected());

    client.set("k", b"v").await.unwrap();
    assert_eq!(fresh.get("k", 1).await.unwrap(), b"v");

    server.shutdown().await;
}

#[tokio::test]
async fn test_overwrite_returns_latest_value() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = connected_client(&server.address).await;

    client.set("k", b"first value").await.unwrap();
    client.set("k", b"second").await.unwrap();
    assert_eq!(client.get("k", 6).await.unwrap(), b"second");

    server.shutdown().await;
}

#[tokio::test]
async fn test_operations_after_disconnect_fail() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = connected_client(&server.address).await;

    client.set("k", b"v").await.unwrap();
    client.disconnect().unwrap();
    client.disconnect().unwrap();

    assert!(matches!(client.set("k", b"w").await, Err(KvError::Connection(_))));
    assert!(matches!(client.get("k", 1).await, Err(KvError::Connection(_))));

    client.connect(&server.address).await.unwrap();
    assert_eq!(client.get("k", 1).await.unwrap(), b"v");

    server.shutdown().await;
}

#[tokio::test]
async fn test_get_into_small_buffer_fails_without_truncating() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = connected_client(&server.address).await;

    client.set("k", b"0123456789").await.unwrap();
    let err = client.get("k", 4).await.unwrap_err();
    assert_eq!(err.status(), -1);

    // A larger buffer gets exactly the stored bytes.
    assert_eq!(client.get("k", 64).await.unwrap(), b"0123456789");

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_get_buffers_fail_cleanly() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = KvClient::new(ClientConfig {
        registry_capacity: 1024,
        ..Default::default()
    });
    client.connect(&server.address).await.unwrap();
    client.set("k", b"v").await.unwrap();

    assert!(matches!(client.get("k", usize::MAX).await, Err(KvError::Protocol(_))));
    assert!(matches!(client.get("k", 1025).await, Err(KvError::Registration(_))));
    let stats = client.registry_stats();
    assert_eq!(stats.live_handles, 0);
    assert_eq!(stats.used, 0);

    // The session survives.
    assert!(client.is_connected());
    assert_eq!(client.get("k", 1).await.unwrap(), b"v");

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_keys_fail_locally() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = connected_client(&server.address).await;

    for key in ["", "a/b", ".."] {
        assert!(matches!(client.set(key, b"v").await, Err(KvError::Protocol(_))));
    }
    assert!(matches!(client.set("k", b"").await, Err(KvError::Protocol(_))));
    assert_eq!(client.registry_stats().live_handles, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_large_values_are_chunked() {
    init_tracing();
    let config = ServerConfig {
        transfer: TransferConfig {
            chunk_size: 64 * 1024,
        },
        ..test_config()
    };
    let server = TestServer::start(config, Arc::new(MemoryBackend::new())).await;
    let client = connected_client(&server.address).await;

    let value: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();
    client.set("big", &value).await.unwrap();
    assert_eq!(client.get("big", value.len()).await.unwrap(), value);
    assert_eq!(client.fetch("big").await.unwrap(), value);

    server.shutdown().await;
}

#[tokio::test]
async fn test_chunk_size_above_frame_limit_keeps_session() {
    init_tracing();
    let config = ServerConfig {
        transfer: TransferConfig {
            chunk_size: 32 * 1024 * 1024,
        },
        ..test_config()
    };
    let server = TestServer::start(config, Arc::new(MemoryBackend::new())).await;
    let client = connected_client(&server.address).await;

    let value: Vec<u8> = (0..20 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    client.set("big", &value).await.unwrap();
    assert_eq!(client.get("big", value.len()).await.unwrap(), value);

    assert!(client.is_connected());
    client.set("small", b"x").await.unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn test_exists_and_size() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = connected_client(&server.address).await;

    assert!(!client.exists("k").await.unwrap());
    assert!(client.value_size("k").await.is_err());

    client.set("k", b"hello").await.unwrap();
    assert!(client.exists("k").await.unwrap());
    assert_eq!(client.value_size("k").await.unwrap(), 5);
    assert_eq!(client.fetch("k").await.unwrap(), b"hello");

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_writers_leave_one_value() {
    init_tracing();

    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FsBackend::open(dir.path()).unwrap());
    let config = ServerConfig {
        transfer: TransferConfig { chunk_size: 4096 },
        ..test_config()
    };
    let server = TestServer::start(config, backend).await;

    let a = Arc::new(connected_client(&server.address).await);
    let b = Arc::new(connected_client(&server.address).await);
    let v1 = vec![b'1'; 512 * 1024];
    let v2 = vec![b'2'; 512 * 1024];

    for _ in 0..4 {
        let (ra, rb) = tokio::join!(a.set("shared", &v1), b.set("shared", &v2));
        ra.unwrap();
        rb.unwrap();

        let stored = a.get("shared", v1.len()).await.unwrap();
        assert!(stored == v1 || stored == v2, "interleaved value stored");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_timeout_cancels_server_work() {
    init_tracing();

    let backend = Arc::new(SlowBackend {
        inner: MemoryBackend::new(),
        delay: Duration::from_millis(500),
    });
    let server = TestServer::start(test_config(), backend.clone()).await;

    let client = KvClient::new(ClientConfig {
        timeout_ms: 100,
        ..Default::default()
    });
    client.connect(&server.address).await.unwrap();

    let err = client.set("slow", b"value").await.unwrap_err();
    assert!(matches!(err, KvError::Timeout(_)));
    assert_eq!(client.registry_stats().live_handles, 0);

    // The abandoned write never lands.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!backend.inner.exists("slow").await.unwrap());

    // The session is still usable.
    backend.inner.put("fast", b"ok".to_vec()).await.unwrap();
    assert_eq!(client.get("fast", 2).await.unwrap(), b"ok");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_inflight_requests() {
    init_tracing();

    let backend = Arc::new(SlowBackend {
        inner: MemoryBackend::new(),
        delay: Duration::from_millis(300),
    });
    let server = TestServer::start(test_config(), backend.clone()).await;
    let client = Arc::new(connected_client(&server.address).await);

    let writer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.set("k", b"v").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown().await;

    // The in-flight set finished before the server stopped.
    writer.await.unwrap().unwrap();
    assert!(backend.inner.exists("k").await.unwrap());

    assert!(client.set("k", b"w").await.is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_after_grace_period() {
    init_tracing();

    let backend = Arc::new(SlowBackend {
        inner: MemoryBackend::new(),
        delay: Duration::from_secs(30),
    });
    let config = ServerConfig {
        shutdown_grace_ms: 100,
        ..test_config()
    };
    let server = TestServer::start(config, backend.clone()).await;
    let client = Arc::new(connected_client(&server.address).await);

    let writer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.set("k", b"v").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown().await;

    let err = writer.await.unwrap().unwrap_err();
    assert_eq!(err.status(), -1);
    assert!(!backend.inner.exists("k").await.unwrap());
}

#[tokio::test]
async fn test_peer_file_lifecycle() {
    init_tracing();

    let peers = TempDir::new().unwrap();
    let config = ServerConfig {
        peer_dir: Some(peers.path().to_path_buf()),
        ..test_config()
    };
    let server = TestServer::start(config, Arc::new(MemoryBackend::new())).await;

    let found = discover_peers(peers.path()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].addr, server.address);
    assert_eq!(found[0].provider_id, std::process::id());

    let client = connected_client(&found[0].addr).await;
    client.set("k", b"v").await.unwrap();

    server.shutdown().await;
    assert!(discover_peers(peers.path()).unwrap().is_empty());
}
