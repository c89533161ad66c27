//! Bulk buffer registration
//!
//! Regions live in an arena keyed by handle id. Registering a buffer checks it
//! into the arena and hands back a [`BulkHandle`]; releasing the handle checks
//! the buffer back out. Remote peers only ever see a [`BulkDescriptor`] and
//! address the region through the registry by id, so a stale descriptor can at
//! worst name a region that no longer exists.

use crate::error::{KvError, Result};
use crate::protocol::{AccessMode, BulkDescriptor, Side};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A registered region
struct Region {
    buffer: Vec<u8>,
    mode: AccessMode,
    /// Highest byte offset written by a transfer
    written: usize,
    /// Set while a local transfer references the region
    busy: bool,
}

struct RegistryInner {
    side: Side,
    regions: DashMap<u64, Region>,
    next_id: AtomicU64,
    capacity: usize,
    used: AtomicUsize,
}

impl RegistryInner {
    fn checkout(&self, id: u64) -> Option<Region> {
        let (_, region) = self.regions.remove(&id)?;
        self.used.fetch_sub(region.buffer.len(), Ordering::AcqRel);
        Some(region)
    }

    fn read(&self, id: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let region = self
            .regions
            .get(&id)
            .ok_or_else(|| KvError::Transfer(format!("bulk handle {} is not registered", id)))?;
        if !region.mode.can_read() {
            return Err(KvError::Transfer(format!(
                "bulk handle {} is {:?} and cannot be read",
                id, region.mode
            )));
        }
        let range = checked_range(id, offset, len, region.buffer.len())?;
        Ok(region.buffer[range].to_vec())
    }

    fn write(&self, id: u64, offset: u64, data: &[u8]) -> Result<u64> {
        let mut region = self
            .regions
            .get_mut(&id)
            .ok_or_else(|| KvError::Transfer(format!("bulk handle {} is not registered", id)))?;
        if !region.mode.can_write() {
            return Err(KvError::Transfer(format!(
                "bulk handle {} is {:?} and cannot be written",
                id, region.mode
            )));
        }
        let range = checked_range(id, offset, data.len() as u64, region.buffer.len())?;
        let end = range.end;
        region.buffer[range].copy_from_slice(data);
        region.written = region.written.max(end);
        Ok(data.len() as u64)
    }
}

/// Arena of registered regions for one side of a connection
#[derive(Clone)]
pub struct BulkRegistry {
    inner: Arc<RegistryInner>,
}

impl BulkRegistry {
    /// Create a registry that may hold up to `capacity` bytes at once.
    pub fn new(side: Side, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                side,
                regions: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Register `buffer` for transfers with the given access mode.
    pub fn register(&self, buffer: Vec<u8>, mode: AccessMode) -> Result<BulkHandle> {
        self.reserve(buffer.len())?;
        Ok(self.insert(buffer, mode))
    }

    /// Allocate a zeroed region of `len` bytes and register it.
    ///
    /// Capacity is claimed before the buffer is allocated, so an oversized
    /// request fails without touching memory.
    pub fn allocate(&self, len: usize, mode: AccessMode) -> Result<BulkHandle> {
        self.reserve(len)?;
        let mut buffer = Vec::new();
        if let Err(e) = buffer.try_reserve_exact(len) {
            self.inner.used.fetch_sub(len, Ordering::AcqRel);
            return Err(KvError::Registration(format!(
                "cannot allocate {} bytes: {}",
                len, e
            )));
        }
        buffer.resize(len, 0);
        Ok(self.insert(buffer, mode))
    }

    fn reserve(&self, len: usize) -> Result<()> {
        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|total| *total <= self.inner.capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                KvError::Registration(format!(
                    "cannot register {} bytes: {} of {} already registered",
                    len, used, self.inner.capacity
                ))
            })
    }

    /// Check a buffer whose bytes are already reserved into the arena.
    fn insert(&self, buffer: Vec<u8>, mode: AccessMode) -> BulkHandle {
        let len = buffer.len();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.regions.insert(
            id,
            Region {
                buffer,
                mode,
                written: 0,
                busy: false,
            },
        );

        tracing::trace!("Registered bulk region {} ({} bytes, {:?})", id, len, mode);

        BulkHandle {
            id,
            len,
            mode,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Copy bytes out of a region on behalf of a transfer.
    pub fn read(&self, id: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.inner.read(id, offset, len)
    }

    /// Copy bytes into a region on behalf of a transfer.
    ///
    /// Writes past the registered length fail without touching the region.
    pub fn write(&self, id: u64, offset: u64, data: &[u8]) -> Result<u64> {
        self.inner.write(id, offset, data)
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.regions.contains_key(&id)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_handles: self.inner.regions.len(),
            used: self.inner.used.load(Ordering::Acquire),
            capacity: self.inner.capacity,
        }
    }
}

fn checked_range(id: u64, offset: u64, len: u64, region_len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= region_len as u64)
        .ok_or_else(|| {
            KvError::Transfer(format!(
                "range {}+{} is outside bulk handle {} of {} bytes",
                offset, len, id, region_len
            ))
        })?;
    Ok(offset as usize..end as usize)
}

/// Exclusive ownership of one registered region
///
/// Not `Clone`: [`BulkHandle::release`] consumes the handle, so a region can
/// only be released once and cannot be used afterwards. A handle dropped
/// without release is reclaimed and reported as a leak.
pub struct BulkHandle {
    id: u64,
    len: usize,
    mode: AccessMode,
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHandle")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("owner", &self.inner.side)
            .finish()
    }
}

impl BulkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.inner.regions.contains_key(&self.id)
    }

    /// Descriptor to send to the peer that will drive the transfer.
    pub fn descriptor(&self) -> BulkDescriptor {
        BulkDescriptor {
            id: self.id,
            len: self.len as u64,
            mode: self.mode,
            owner: self.inner.side,
        }
    }

    /// Mark the region as referenced by a transfer until the guard drops.
    pub fn begin_transfer(&self) -> Result<TransferGuard<'_>> {
        let mut region = self
            .inner
            .regions
            .get_mut(&self.id)
            .ok_or_else(|| KvError::Transfer(format!("bulk handle {} is not registered", self.id)))?;
        if region.busy {
            return Err(KvError::Transfer(format!(
                "bulk handle {} already has a transfer in flight",
                self.id
            )));
        }
        region.busy = true;
        Ok(TransferGuard { handle: self })
    }

    pub(crate) fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.inner.read(self.id, offset, len)
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.inner.write(self.id, offset, data)
    }

    /// Unregister the region and take its buffer back.
    pub fn release(self) -> ReleasedRegion {
        match self.inner.checkout(self.id) {
            Some(region) => {
                tracing::trace!("Released bulk region {}", self.id);
                ReleasedRegion {
                    buffer: region.buffer,
                    written: region.written,
                }
            }
            None => ReleasedRegion {
                buffer: Vec::new(),
                written: 0,
            },
        }
    }
}

impl Drop for BulkHandle {
    fn drop(&mut self) {
        if self.inner.checkout(self.id).is_some() {
            tracing::warn!("Bulk handle {} dropped without release; reclaimed", self.id);
        }
    }
}

/// Clears the busy flag of a region when dropped
pub struct TransferGuard<'a> {
    handle: &'a BulkHandle,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut region) = self.handle.inner.regions.get_mut(&self.handle.id) {
            region.busy = false;
        }
    }
}

/// Buffer returned by [`BulkHandle::release`]
#[derive(Debug)]
pub struct ReleasedRegion {
    pub buffer: Vec<u8>,
    /// Bytes `[0, written)` were the target of at least one transfer
    pub written: usize,
}

impl ReleasedRegion {
    /// The prefix of the buffer that transfers actually filled.
    pub fn into_written(mut self) -> Vec<u8> {
        self.buffer.truncate(self.written);
        self.buffer
    }
}

/// Registry statistics
#[derive(Clone, Debug)]
pub struct RegistryStats {
    pub live_handles: usize,
    pub used: usize,
    pub capacity: usize,
}
