pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod transport;

pub use client::{ClientConfig, KvClient};
pub use error::{KvError, Result};
pub use memory::{BulkHandle, BulkRegistry};
pub use protocol::{Address, BulkDescriptor, RpcRequest, RpcResponse};
pub use server::{KvServer, ServerConfig};
pub use storage::{BackendConfig, StorageBackend};
pub use transport::{TransferConfig, TransferEngine};
