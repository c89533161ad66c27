//! Protocol types for the bulk key/value service
//!
//! Requests and responses are small messages; values never travel inside them.
//! Instead a request names a bulk handle registered by the caller, and the
//! server moves the payload with separate `BulkRead`/`BulkWrite` frames on the
//! same connection.

use crate::error::{KvError, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OP_SET: &str = "set";
pub const OP_GET: &str = "get";
pub const OP_EXISTS: &str = "exists";
pub const OP_GET_SIZE: &str = "get_size";

/// Largest encoded frame accepted on either side of a connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest bulk payload per frame; the rest of the frame limit is headroom
/// for the `BulkWrite`/`BulkData` header.
pub const MAX_CHUNK_LEN: usize = MAX_FRAME_LEN - 4096;

/// Only transport currently wired to a network substrate.
pub const TRANSPORT_TCP: &str = "tcp";

/// Server address of the form `transport://host:port`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub transport: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TRANSPORT_TCP.to_string(),
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip().to_string(), addr.port())
    }

    /// Resolve the host part into socket addresses.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if self.transport != TRANSPORT_TCP {
            return Err(KvError::Connection(format!(
                "unsupported transport {:?} in {}",
                self.transport, self
            )));
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| KvError::Connection(format!("failed to resolve {}: {}", self, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(KvError::Connection(format!("{} resolved to no addresses", self)));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.transport, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.transport, self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed =
            || KvError::Connection(format!("address {:?} is not of the form transport://host:port", s));

        let (transport, rest) = s.split_once("://").ok_or_else(malformed)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(malformed)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port: u16 = port.parse().map_err(|_| malformed())?;

        if transport.is_empty() || host.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            transport: transport.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Which transfers a registered region may take part in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// The region may only be the source of a transfer.
    ReadOnly,
    /// The region may only be the destination of a transfer.
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// Side of the connection that registered a region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

/// Transferable reference to a region registered by the other side
///
/// This is the only form in which a handle crosses the wire. It does not own
/// the region; the registrant keeps the `BulkHandle` and releases it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDescriptor {
    pub id: u64,
    pub len: u64,
    pub mode: AccessMode,
    pub owner: Side,
}

/// A named remote operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub operation: String,
    pub key: String,
    /// Declared payload size in bytes
    pub size: i32,
    pub bulk: BulkDescriptor,
}

impl RpcRequest {
    pub fn new(operation: &str, key: &str, size: i32, bulk: BulkDescriptor) -> Self {
        Self {
            operation: operation.to_string(),
            key: key.to_string(),
            size,
            bulk,
        }
    }
}

/// Status reply; `0` on success, negative on failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ret: i32,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            ret: crate::error::STATUS_OK,
        }
    }

    pub fn failed() -> Self {
        Self {
            ret: crate::error::STATUS_FAILED,
        }
    }

    pub fn from_error(error: &KvError) -> Self {
        Self { ret: error.status() }
    }

    pub fn is_ok(&self) -> bool {
        self.ret == crate::error::STATUS_OK
    }
}

/// Everything that travels on a connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Call {
        request_id: u64,
        request: RpcRequest,
    },
    Reply {
        request_id: u64,
        response: RpcResponse,
    },
    /// The client stopped waiting for `request_id`.
    Cancel { request_id: u64 },
    /// Server asks the client for bytes out of one of its regions.
    BulkRead {
        transfer_id: u64,
        handle: u64,
        offset: u64,
        len: u64,
    },
    BulkData {
        transfer_id: u64,
        result: std::result::Result<Vec<u8>, String>,
    },
    /// Server writes bytes into one of the client's regions.
    BulkWrite {
        transfer_id: u64,
        handle: u64,
        offset: u64,
        data: Vec<u8>,
    },
    BulkAck {
        transfer_id: u64,
        result: std::result::Result<u64, String>,
    },
}

impl Frame {
    /// Frame name for logs; payloads are never printed.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Call { .. } => "Call",
            Frame::Reply { .. } => "Reply",
            Frame::Cancel { .. } => "Cancel",
            Frame::BulkRead { .. } => "BulkRead",
            Frame::BulkData { .. } => "BulkData",
            Frame::BulkWrite { .. } => "BulkWrite",
            Frame::BulkAck { .. } => "BulkAck",
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_len = bincode::serialized_size(frame)? as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(KvError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            body_len, MAX_FRAME_LEN
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    let mut out = buf.writer();
    bincode::serialize_into(&mut out, frame)?;
    let buf = out.into_inner();

    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(KvError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

/// Reject keys that are empty or could escape a storage namespace.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::Protocol("empty key".to_string()));
    }
    if key == "." || key == ".." {
        return Err(KvError::Protocol(format!("key {:?} is reserved", key)));
    }
    if let Some(c) = key
        .chars()
        .find(|c| c.is_control() || *c == '/' || *c == '\\')
    {
        return Err(KvError::Protocol(format!(
            "key {:?} contains forbidden character {:?}",
            key, c
        )));
    }
    Ok(())
}

/// Check a declared payload size and convert it to a byte count.
pub fn validate_size(size: i32, max: usize) -> Result<usize> {
    if size <= 0 {
        return Err(KvError::Protocol(format!("non-positive size {}", size)));
    }
    let size = size as usize;
    if size > max {
        return Err(KvError::Protocol(format!(
            "size {} exceeds maximum of {}",
            size, max
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr: Address = "tcp://127.0.0.1:1234".parse().unwrap();
        assert_eq!(addr, Address::tcp("127.0.0.1", 1234));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:1234");

        let v6: Address = "tcp://[::1]:50051".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "tcp://[::1]:50051");

        for bad in ["127.0.0.1:1234", "tcp://", "tcp://host", "tcp://host:port", "://h:1"] {
            assert!(
                matches!(bad.parse::<Address>(), Err(KvError::Connection(_))),
                "{} should not parse",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_unsupported_transport_fails_resolution() {
        let addr: Address = "verbs://10.0.0.1:1234".parse().unwrap();
        assert!(matches!(addr.resolve().await, Err(KvError::Connection(_))));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("foo").is_ok());
        assert!(validate_key("key with spaces_and.dots").is_ok());
        assert!(validate_key(".hidden").is_ok());

        for bad in ["", ".", "..", "a/b", "../etc/passwd", "a\\b", "nul\0byte", "tab\tkey"] {
            assert!(
                matches!(validate_key(bad), Err(KvError::Protocol(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_size_validation() {
        assert_eq!(validate_size(3, 10).unwrap(), 3);
        assert!(matches!(validate_size(0, 10), Err(KvError::Protocol(_))));
        assert!(matches!(validate_size(-5, 10), Err(KvError::Protocol(_))));
        assert!(matches!(validate_size(11, 10), Err(KvError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let descriptor = BulkDescriptor {
            id: 7,
            len: 3,
            mode: AccessMode::ReadOnly,
            owner: Side::Client,
        };
        let call = Frame::Call {
            request_id: 1,
            request: RpcRequest::new(OP_SET, "foo", 3, descriptor),
        };
        let ack = Frame::BulkAck {
            transfer_id: 9,
            result: Err("region released".to_string()),
        };

        write_frame(&mut a, &call).await.unwrap();
        write_frame(&mut a, &ack).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(call));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(ack));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(KvError::Protocol(_))));
    }
}
