use std::sync::Arc;

use crate::error::Result;
use crate::region::{ExchangeSlot, OpCounter, Placement, RegionId, TransportRegion};
use crate::types::{DeviceOrdinal, ProcessId};

/// Class of the direct link between two devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkClass {
    /// Traffic crosses the PCIe tree.
    Pcie,
    /// Dedicated point-to-point mesh link.
    Mesh,
}

/// Everything the adapter needs to allocate a transport region.
#[derive(Debug, Clone)]
pub struct RegionRequest {
    pub device: DeviceOrdinal,
    pub placement: Placement,
    pub staging_bytes: usize,
    pub exchange: ExchangeSlot,
    pub op_counter: Arc<OpCounter>,
}

/// Opaque token that lets another process open a device region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcMemHandle {
    pub region: RegionId,
    pub device: DeviceOrdinal,
    pub process: ProcessId,
}

/// The device runtime underneath the ring engine.
///
/// The engine never touches device memory management directly: every
/// allocation, mapping, and capability query goes through this trait, and
/// every successful acquisition is paired with exactly one release call.
///
/// - `HostAdapter` (built-in): devices simulated in host memory over a
///   shared [`Fabric`](super::Fabric).
/// - GPU adapters: implemented externally over the vendor runtime.
pub trait DeviceAdapter: Send + Sync + std::fmt::Debug {
    /// Number of devices visible to this adapter.
    fn device_count(&self) -> usize;

    /// Identity of the process driving this adapter.
    fn process_id(&self) -> ProcessId;

    /// Identity of the host this process runs on.
    fn host_id(&self) -> String;

    /// Link class between two distinct devices.
    fn link_class(&self, a: DeviceOrdinal, b: DeviceOrdinal) -> Result<LinkClass>;

    /// Whether `from` can address `to`'s memory directly.
    fn can_access_peer(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<bool>;

    /// Map `to`'s memory into `from`'s address space.
    fn enable_peer_access(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<()>;

    /// Undo one [`enable_peer_access`](Self::enable_peer_access).
    fn disable_peer_access(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<()>;

    /// Allocate a zeroed, page-aligned transport region.
    fn alloc_region(&self, request: RegionRequest) -> Result<Arc<TransportRegion>>;

    /// Free a region returned by [`alloc_region`](Self::alloc_region).
    fn free_region(&self, device: DeviceOrdinal, region: RegionId) -> Result<()>;

    /// Export a device region for opening from another process.
    fn ipc_export(&self, region: &Arc<TransportRegion>) -> Result<IpcMemHandle>;

    /// Open a region exported by another process on `device`.
    fn ipc_open(&self, device: DeviceOrdinal, handle: &IpcMemHandle)
    -> Result<Arc<TransportRegion>>;

    /// Close a region opened with [`ipc_open`](Self::ipc_open).
    fn ipc_close(&self, device: DeviceOrdinal, region: RegionId) -> Result<()>;

    /// Map a host-resident region into `device`.
    fn host_map(&self, device: DeviceOrdinal, region: &Arc<TransportRegion>) -> Result<()>;

    /// Undo one [`host_map`](Self::host_map).
    fn host_unmap(&self, device: DeviceOrdinal, region: RegionId) -> Result<()>;
}
