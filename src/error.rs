//! Error taxonomy shared by client, server and storage backends.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KvError>;

/// Wire status for a successful operation.
pub const STATUS_OK: i32 = 0;
/// Wire status for any failed operation. The response carries no finer detail.
pub const STATUS_FAILED: i32 = -1;

#[derive(Error, Debug)]
pub enum KvError {
    /// Address could not be resolved, or the session is not connected.
    #[error("connection error: {0}")]
    Connection(String),
    /// A local buffer could not be exposed for transfer.
    #[error("registration error: {0}")]
    Registration(String),
    /// A pull/push failed or moved fewer bytes than declared.
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("key not found: {0}")]
    NotFound(String),
    /// Malformed request: bad key, non-positive size, undecodable frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A server handler panicked or its task died.
    #[error("handler failed: {0}")]
    Handler(String),
    /// The handler was abandoned after a client timeout or server shutdown.
    #[error("request cancelled")]
    Cancelled,
    /// The server answered with a non-zero status.
    #[error("{operation} failed with status {status}")]
    Remote { operation: String, status: i32 },
    #[error("operation {0:?} registered twice")]
    DuplicateOperation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    /// Status code reported on the wire for this error.
    pub fn status(&self) -> i32 {
        match self {
            KvError::Remote { status, .. } => *status,
            _ => STATUS_FAILED,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}

impl From<bincode::Error> for KvError {
    fn from(e: bincode::Error) -> Self {
        Self::Protocol(format!("frame codec: {}", e))
    }
}

impl From<serde_json::Error> for KvError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {}", e))
    }
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        Self::Storage(format!("redis: {}", e))
    }
}
