//! Bulk transfer engine
//!
//! The side that drives a transfer holds a local [`BulkHandle`] and a
//! [`BulkDescriptor`] naming a region on the other side. A *pull* copies remote
//! bytes into the local region; a *push* copies local bytes into the remote
//! region. The remote side is reached through a [`BulkEndpoint`]: either a
//! connection to the peer ([`PeerEndpoint`]) or, in-process, the peer's
//! [`BulkRegistry`] itself.

use crate::connection::Outbox;
use crate::error::{KvError, Result};
use crate::memory::{BulkHandle, BulkRegistry};
use crate::protocol::{BulkDescriptor, Frame, MAX_CHUNK_LEN};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Configuration for the transfer engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest number of bytes moved by a single bulk frame
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024, // 1MB
        }
    }
}

pub type BulkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Access to regions registered by the other side of a transfer
pub trait BulkEndpoint: Send + Sync {
    /// Copy `len` bytes at `offset` out of the remote region `handle`.
    fn read_remote(&self, handle: u64, offset: u64, len: u64) -> BulkFuture<'_, Vec<u8>>;

    /// Copy `data` into the remote region `handle` at `offset`.
    /// Returns the number of bytes the remote side accepted.
    fn write_remote(&self, handle: u64, offset: u64, data: Vec<u8>) -> BulkFuture<'_, u64>;
}

/// In-process endpoint: the remote regions live in this registry.
impl BulkEndpoint for BulkRegistry {
    fn read_remote(&self, handle: u64, offset: u64, len: u64) -> BulkFuture<'_, Vec<u8>> {
        let result = self.read(handle, offset, len);
        Box::pin(async move { result })
    }

    fn write_remote(&self, handle: u64, offset: u64, data: Vec<u8>) -> BulkFuture<'_, u64> {
        let result = self.write(handle, offset, &data);
        Box::pin(async move { result })
    }
}

/// Reply to a bulk frame, routed back by the connection reader
#[derive(Debug)]
pub enum BulkReply {
    Data(std::result::Result<Vec<u8>, String>),
    Ack(std::result::Result<u64, String>),
}

struct PeerInner {
    outbox: Outbox,
    pending: DashMap<u64, oneshot::Sender<BulkReply>>,
    next_transfer: AtomicU64,
}

/// Endpoint that reaches the peer's regions over its connection
#[derive(Clone)]
pub struct PeerEndpoint {
    inner: Arc<PeerInner>,
}

impl PeerEndpoint {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                outbox,
                pending: DashMap::new(),
                next_transfer: AtomicU64::new(1),
            }),
        }
    }

    /// Hand a reply from the peer to the transfer waiting for it.
    pub fn complete(&self, transfer_id: u64, reply: BulkReply) {
        match self.inner.pending.remove(&transfer_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(reply);
            }
            None => {
                tracing::debug!("Dropping reply for abandoned transfer {}", transfer_id);
            }
        }
    }

    /// Fail every waiting transfer; called when the connection goes away.
    pub fn abandon_all(&self) {
        self.inner.pending.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    async fn round_trip(&self, frame_for: impl FnOnce(u64) -> Frame) -> Result<BulkReply> {
        let transfer_id = self.inner.next_transfer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(transfer_id, tx);
        let _pending = PendingTransfer {
            pending: &self.inner.pending,
            transfer_id,
        };

        self.inner
            .outbox
            .send(frame_for(transfer_id))
            .await
            .map_err(|_| KvError::Transfer("connection closed before bulk request was sent".to_string()))?;

        rx.await
            .map_err(|_| KvError::Transfer("connection closed during bulk transfer".to_string()))
    }
}

/// Removes a pending transfer if its waiter goes away first
struct PendingTransfer<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<BulkReply>>,
    transfer_id: u64,
}

impl Drop for PendingTransfer<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.transfer_id);
    }
}

impl BulkEndpoint for PeerEndpoint {
    fn read_remote(&self, handle: u64, offset: u64, len: u64) -> BulkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let reply = self
                .round_trip(|transfer_id| Frame::BulkRead {
                    transfer_id,
                    handle,
                    offset,
                    len,
                })
                .await?;
            match reply {
                BulkReply::Data(Ok(data)) => Ok(data),
                BulkReply::Data(Err(e)) => Err(KvError::Transfer(format!(
                    "peer refused read of handle {}: {}",
                    handle, e
                ))),
                BulkReply::Ack(_) => Err(KvError::Protocol(
                    "write acknowledgement received for a bulk read".to_string(),
                )),
            }
        })
    }

    fn write_remote(&self, handle: u64, offset: u64, data: Vec<u8>) -> BulkFuture<'_, u64> {
        Box::pin(async move {
            let reply = self
                .round_trip(move |transfer_id| Frame::BulkWrite {
                    transfer_id,
                    handle,
                    offset,
                    data,
                })
                .await?;
            match reply {
                BulkReply::Ack(Ok(written)) => Ok(written),
                BulkReply::Ack(Err(e)) => Err(KvError::Transfer(format!(
                    "peer refused write to handle {}: {}",
                    handle, e
                ))),
                BulkReply::Data(_) => Err(KvError::Protocol(
                    "data received for a bulk write".to_string(),
                )),
            }
        })
    }
}

/// Direction of a transfer, seen from the side that drives it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Remote region -> local region
    Pull,
    /// Local region -> remote region
    Push,
}

/// Request for a single bulk transfer
#[derive(Debug)]
pub struct TransferRequest<'a> {
    pub direction: Direction,
    /// Region registered by the peer
    pub remote: BulkDescriptor,
    pub remote_offset: u64,
    /// Region registered locally
    pub local: &'a BulkHandle,
    pub local_offset: u64,
    /// Transfer length in bytes
    pub length: u64,
}

/// Result of a completed transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub chunks: u32,
}

/// Drives pulls and pushes between local handles and remote descriptors
#[derive(Clone, Debug)]
pub struct TransferEngine {
    config: TransferConfig,
}

impl TransferEngine {
    /// Build an engine; `chunk_size` is clamped to `1..=MAX_CHUNK_LEN`.
    pub fn new(config: TransferConfig) -> Self {
        let chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_LEN);
        if chunk_size != config.chunk_size {
            tracing::warn!(
                "chunk_size {} out of range, using {}",
                config.chunk_size,
                chunk_size
            );
        }
        Self {
            config: TransferConfig { chunk_size },
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Copy `length` bytes from the remote region into `local`.
    pub async fn pull(
        &self,
        peer: &dyn BulkEndpoint,
        remote: &BulkDescriptor,
        local: &BulkHandle,
        length: u64,
    ) -> Result<TransferResult> {
        self.transfer(
            peer,
            TransferRequest {
                direction: Direction::Pull,
                remote: *remote,
                remote_offset: 0,
                local,
                local_offset: 0,
                length,
            },
        )
        .await
    }

    /// Copy `length` bytes from `local` into the remote region.
    pub async fn push(
        &self,
        peer: &dyn BulkEndpoint,
        local: &BulkHandle,
        remote: &BulkDescriptor,
        length: u64,
    ) -> Result<TransferResult> {
        self.transfer(
            peer,
            TransferRequest {
                direction: Direction::Push,
                remote: *remote,
                remote_offset: 0,
                local,
                local_offset: 0,
                length,
            },
        )
        .await
    }

    /// Execute a transfer, chunked to `chunk_size` bytes per bulk frame.
    pub async fn transfer(
        &self,
        peer: &dyn BulkEndpoint,
        request: TransferRequest<'_>,
    ) -> Result<TransferResult> {
        validate(&request)?;
        let _busy = request.local.begin_transfer()?;

        let chunk_size = self.config.chunk_size as u64;
        let mut done = 0u64;
        let mut chunks = 0u32;

        while done < request.length {
            let n = (request.length - done).min(chunk_size);
            let remote_offset = request.remote_offset + done;
            let local_offset = request.local_offset + done;

            let moved = match request.direction {
                Direction::Pull => {
                    let data = peer.read_remote(request.remote.id, remote_offset, n).await?;
                    if data.len() as u64 != n {
                        return Err(short_transfer(&request, done + data.len() as u64));
                    }
                    request.local.write(local_offset, &data)?
                }
                Direction::Push => {
                    let data = request.local.read(local_offset, n)?;
                    peer.write_remote(request.remote.id, remote_offset, data).await?
                }
            };
            if moved != n {
                return Err(short_transfer(&request, done + moved));
            }

            done += n;
            chunks += 1;
        }

        tracing::debug!(
            "{:?} of {} bytes done: remote handle {}, local handle {}, {} chunks",
            request.direction,
            done,
            request.remote.id,
            request.local.id(),
            chunks
        );

        Ok(TransferResult {
            bytes_transferred: done,
            chunks,
        })
    }
}

fn validate(request: &TransferRequest<'_>) -> Result<()> {
    let (remote_ok, local_ok, verb) = match request.direction {
        Direction::Pull => (
            request.remote.mode.can_read(),
            request.local.mode().can_write(),
            "pull",
        ),
        Direction::Push => (
            request.remote.mode.can_write(),
            request.local.mode().can_read(),
            "push",
        ),
    };
    if !remote_ok {
        return Err(KvError::Transfer(format!(
            "cannot {} with remote handle {} registered {:?}",
            verb, request.remote.id, request.remote.mode
        )));
    }
    if !local_ok {
        return Err(KvError::Transfer(format!(
            "cannot {} with local handle {} registered {:?}",
            verb,
            request.local.id(),
            request.local.mode()
        )));
    }

    let remote_end = request.remote_offset.checked_add(request.length);
    if remote_end.map_or(true, |end| end > request.remote.len) {
        return Err(KvError::Transfer(format!(
            "{} of {} bytes exceeds remote handle {} of {} bytes",
            verb, request.length, request.remote.id, request.remote.len
        )));
    }
    let local_end = request.local_offset.checked_add(request.length);
    if local_end.map_or(true, |end| end > request.local.len() as u64) {
        return Err(KvError::Transfer(format!(
            "{} of {} bytes exceeds local handle {} of {} bytes",
            verb,
            request.length,
            request.local.id(),
            request.local.len()
        )));
    }
    Ok(())
}

fn short_transfer(request: &TransferRequest<'_>, moved: u64) -> KvError {
    KvError::Transfer(format!(
        "{:?} moved {} of {} declared bytes",
        request.direction, moved, request.length
    ))
}
