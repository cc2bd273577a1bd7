//! Ownership-tagged handles to transport regions.
//!
//! A communicator holds one handle to each region it owns and one to the
//! region of each ring successor. The tag records how the memory was
//! acquired, which decides how it is given back: freed, unmapped, closed, or
//! left alone when the handle merely aliases memory owned elsewhere.

use std::sync::Arc;

use crate::device::{DeviceAdapter, IpcMemHandle};
use crate::error::Result;
use crate::region::TransportRegion;
use crate::types::DeviceOrdinal;

/// How a region was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Allocated by this device; released by freeing it.
    Owned,
    /// Same memory as a region owned by another communicator on this device.
    Aliased,
    /// Peer device memory mapped through peer access.
    PeerMapped { peer: DeviceOrdinal },
    /// Device memory of another process opened through an IPC handle.
    IpcOpened,
    /// Pinned host memory mapped into this device.
    SharedHost,
}

/// How a region owner advertises it to the ring predecessor.
#[derive(Debug, Clone)]
pub enum RegionExport {
    /// Directly addressable from the predecessor's process.
    Direct(Arc<TransportRegion>),
    /// Device memory the predecessor must open through the adapter.
    Ipc(IpcMemHandle),
    /// Host memory the predecessor must map.
    Host(Arc<TransportRegion>),
}

/// A transport region plus the obligation to release it exactly once.
#[derive(Debug)]
pub struct RegionHandle {
    kind: HandleKind,
    device: DeviceOrdinal,
    region: Arc<TransportRegion>,
    adapter: Arc<dyn DeviceAdapter>,
    released: bool,
}

impl RegionHandle {
    pub(crate) fn new(
        kind: HandleKind,
        device: DeviceOrdinal,
        region: Arc<TransportRegion>,
        adapter: Arc<dyn DeviceAdapter>,
    ) -> Self {
        Self {
            kind,
            device,
            region,
            adapter,
            released: false,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Device through which this handle accesses the region.
    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    pub fn region(&self) -> &TransportRegion {
        &self.region
    }

    /// Give the region back to the adapter.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let id = self.region.id();
        match self.kind {
            HandleKind::Owned => {
                self.region.reset_flags();
                self.adapter.free_region(self.device, id)
            }
            HandleKind::Aliased => Ok(()),
            HandleKind::PeerMapped { peer } => self.adapter.disable_peer_access(self.device, peer),
            HandleKind::IpcOpened => self.adapter.ipc_close(self.device, id),
            HandleKind::SharedHost => self.adapter.host_unmap(self.device, id),
        }
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(
                region = %self.region.id(),
                kind = ?self.kind,
                "releasing region handle on drop failed: {e}"
            );
        }
    }
}
