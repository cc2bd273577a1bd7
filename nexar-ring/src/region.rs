//! Transport regions: the fixed-layout memory each device exposes to its
//! ring predecessor.
//!
//! A region holds the two pipeline flags, an exchange slot describing the
//! owner, a view of the owner's operation counter, and the staging buffer the
//! predecessor writes into. `ready` is written by the predecessor and read by
//! the owner; `done` is written by the owner and read by the predecessor.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Result, RingError};
use crate::flag::CrossDeviceFlag;
use crate::types::{DeviceOrdinal, MEM_PAD_ALIGN, Rank};

/// Identifier assigned by the device adapter to every region it allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Where a region's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Device-resident memory of the given device.
    Device(DeviceOrdinal),
    /// Pinned host memory mapped into the owning device.
    HostMapped,
}

/// Per-communicator count of retired collectives.
///
/// The kernel for operation `K` may only write into a peer's staging buffer
/// once that peer's counter has reached `K`. Ring groups of one collective
/// retire through `retire_group`; the last one advances the counter.
#[derive(Debug, Default)]
pub struct OpCounter {
    completed: CachePadded<AtomicU64>,
    groups_done: AtomicUsize,
}

impl OpCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collectives fully retired by the owning communicator.
    pub fn value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Spin until at least `op_index` collectives have retired.
    pub fn wait_for(&self, op_index: u64) {
        let backoff = Backoff::new();
        while self.completed.load(Ordering::Acquire) < op_index {
            backoff.snooze();
        }
    }

    /// Record that one ring group of collective `op_index` finished. Returns
    /// true for the last of `n_groups`, which also advances the counter.
    pub fn retire_group(&self, n_groups: usize, op_index: u64) -> bool {
        let prev = self.groups_done.fetch_add(1, Ordering::AcqRel);
        if prev + 1 < n_groups {
            return false;
        }
        self.groups_done.store(0, Ordering::Relaxed);
        self.completed.store(op_index + 1, Ordering::Release);
        true
    }

    /// Advance past a collective that launched no ring groups.
    pub(crate) fn retire_empty(&self, op_index: u64) {
        self.completed.store(op_index + 1, Ordering::Release);
    }
}

/// Page-aligned, zero-initialized staging memory.
pub struct StagingBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is plain bytes; concurrent access is coordinated by the
// region flags (single writer, single reader, fenced).
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    pub fn new(len: usize, location: impl std::fmt::Display) -> Result<Self> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| RingError::AllocationFailed {
            location: location.to_string(),
            bytes: layout.size(),
        })?;
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len.max(1), MEM_PAD_ALIGN)
            .map_err(|e| RingError::InvalidConfig(format!("staging layout: {e}")))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StagingBuffer({:p}, {}B)", self.ptr, self.len)
    }
}

/// What the owner advertises to peers when the region is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSlot {
    pub rank: Rank,
    pub n_dev: usize,
    pub buffer_size: usize,
}

/// One device's transport region for one ring.
#[derive(Debug)]
pub struct TransportRegion {
    id: RegionId,
    owner: DeviceOrdinal,
    placement: Placement,
    pub(crate) ready: CrossDeviceFlag,
    pub(crate) done: CrossDeviceFlag,
    exchange: ExchangeSlot,
    op_counter: Arc<OpCounter>,
    staging: StagingBuffer,
}

impl TransportRegion {
    pub(crate) fn new(
        id: RegionId,
        owner: DeviceOrdinal,
        placement: Placement,
        staging: StagingBuffer,
        exchange: ExchangeSlot,
        op_counter: Arc<OpCounter>,
    ) -> Self {
        Self {
            id,
            owner,
            placement,
            ready: CrossDeviceFlag::new(),
            done: CrossDeviceFlag::new(),
            exchange,
            op_counter,
            staging,
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn owner(&self) -> DeviceOrdinal {
        self.owner
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn exchange(&self) -> ExchangeSlot {
        self.exchange
    }

    /// The owning communicator's operation counter.
    pub fn op_counter(&self) -> &OpCounter {
        &self.op_counter
    }

    /// "New data available" flag, posted by the ring predecessor.
    pub fn ready(&self) -> &CrossDeviceFlag {
        &self.ready
    }

    /// "Chunk done" flag, posted by the owner for its predecessor.
    pub fn done(&self) -> &CrossDeviceFlag {
        &self.done
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    pub(crate) fn staging_ptr(&self) -> *mut u8 {
        self.staging.as_ptr()
    }

    /// Copy of the staging buffer. Only meaningful while no collective is
    /// running on this ring.
    pub fn staging_snapshot(&self) -> Vec<u8> {
        // SAFETY: the buffer is `len` initialized bytes for the region's life.
        unsafe { std::slice::from_raw_parts(self.staging.as_ptr(), self.staging.len()) }.to_vec()
    }

    /// Zero both pipeline flags.
    pub(crate) fn reset_flags(&self) {
        self.ready.reset();
        self.done.reset();
    }
}
