use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::adapter::{DeviceAdapter, IpcMemHandle, LinkClass, RegionRequest};
use crate::error::{Result, RingError};
use crate::region::{Placement, RegionId, StagingBuffer, TransportRegion};
use crate::topology::{TopologyId, table};
use crate::types::{DeviceOrdinal, ProcessId};

/// An adapter operation that the fabric makes fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AllocRegion { device: DeviceOrdinal },
    IpcExport { device: DeviceOrdinal },
    IpcOpen { device: DeviceOrdinal },
    PeerAccess { from: DeviceOrdinal, to: DeviceOrdinal },
    HostMap { device: DeviceOrdinal },
}

/// Snapshot of resources currently held against a fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub regions: usize,
    pub exports: usize,
    pub peer_mappings: usize,
    pub ipc_opened: usize,
    pub host_mappings: usize,
}

impl LiveResources {
    /// True once every acquisition has been released.
    pub fn is_clear(&self) -> bool {
        *self == LiveResources::default()
    }
}

#[derive(Debug, Default)]
struct FabricState {
    regions: HashMap<RegionId, DeviceOrdinal>,
    exports: HashMap<RegionId, Arc<TransportRegion>>,
    peer_enabled: HashMap<(DeviceOrdinal, DeviceOrdinal), usize>,
    ipc_opened: HashMap<(DeviceOrdinal, RegionId), usize>,
    host_maps: HashMap<(DeviceOrdinal, RegionId), usize>,
}

/// Simulated devices, their links, and the bookkeeping shared by every
/// adapter that drives them.
#[derive(Debug)]
pub struct Fabric {
    n_dev: usize,
    host: String,
    mesh: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    peer: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    fail_link_query: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    fail_peer_query: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    failures: HashSet<FailPoint>,
    next_region: AtomicU64,
    state: Mutex<FabricState>,
}

fn pair(a: DeviceOrdinal, b: DeviceOrdinal) -> (DeviceOrdinal, DeviceOrdinal) {
    (a.min(b), a.max(b))
}

impl Fabric {
    pub fn builder(n_dev: usize) -> FabricBuilder {
        FabricBuilder {
            n_dev,
            host: None,
            mesh: HashSet::new(),
            peer: HashSet::new(),
            fail_link_query: HashSet::new(),
            fail_peer_query: HashSet::new(),
            failures: HashSet::new(),
        }
    }

    /// `n_dev` devices on one PCIe tree with peer access between all of them.
    pub fn pcie(n_dev: usize) -> Self {
        Self::builder(n_dev).all_peer_access().build()
    }

    /// `n_dev` devices wired the way the ring table for `id` assumes.
    pub fn with_topology(id: TopologyId, n_dev: usize) -> Self {
        Self::builder(n_dev)
            .all_peer_access()
            .topology_links(id)
            .build()
    }

    pub fn device_count(&self) -> usize {
        self.n_dev
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resources currently held.
    pub fn live(&self) -> LiveResources {
        match self.state.lock() {
            Ok(s) => LiveResources {
                regions: s.regions.len(),
                exports: s.exports.len(),
                peer_mappings: s.peer_enabled.values().sum(),
                ipc_opened: s.ipc_opened.values().sum(),
                host_mappings: s.host_maps.values().sum(),
            },
            Err(_) => LiveResources::default(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, FabricState>> {
        self.state
            .lock()
            .map_err(|_| RingError::LockPoisoned("fabric state"))
    }

    fn check_device(&self, device: DeviceOrdinal) -> Result<()> {
        if device >= self.n_dev {
            return Err(RingError::device(format!(
                "device {device} not present ({} devices)",
                self.n_dev
            )));
        }
        Ok(())
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.failures.contains(&point)
    }
}

/// Builder for [`Fabric`].
#[derive(Debug)]
pub struct FabricBuilder {
    n_dev: usize,
    host: Option<String>,
    mesh: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    peer: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    fail_link_query: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    fail_peer_query: HashSet<(DeviceOrdinal, DeviceOrdinal)>,
    failures: HashSet<FailPoint>,
}

impl FabricBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn peer_access(mut self, a: DeviceOrdinal, b: DeviceOrdinal) -> Self {
        self.peer.insert(pair(a, b));
        self
    }

    pub fn all_peer_access(mut self) -> Self {
        for a in 0..self.n_dev {
            for b in (a + 1)..self.n_dev {
                self.peer.insert((a, b));
            }
        }
        self
    }

    pub fn mesh_link(mut self, a: DeviceOrdinal, b: DeviceOrdinal) -> Self {
        self.mesh.insert(pair(a, b));
        self
    }

    /// Add the mesh links the table for `id` assumes, treating device
    /// ordinals as table slots.
    pub fn topology_links(mut self, id: TopologyId) -> Self {
        if let Some(t) = table::lookup(id, self.n_dev) {
            self.mesh.extend(t.links.iter().map(|&(a, b)| pair(a, b)));
        }
        self
    }

    pub fn fail(mut self, point: FailPoint) -> Self {
        self.failures.insert(point);
        self
    }

    pub fn fail_link_query(mut self, a: DeviceOrdinal, b: DeviceOrdinal) -> Self {
        self.fail_link_query.insert(pair(a, b));
        self
    }

    pub fn fail_peer_query(mut self, a: DeviceOrdinal, b: DeviceOrdinal) -> Self {
        self.fail_peer_query.insert(pair(a, b));
        self
    }

    pub fn build(self) -> Fabric {
        let host = self
            .host
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        Fabric {
            n_dev: self.n_dev,
            host,
            mesh: self.mesh,
            peer: self.peer,
            fail_link_query: self.fail_link_query,
            fail_peer_query: self.fail_peer_query,
            failures: self.failures,
            next_region: AtomicU64::new(1),
            state: Mutex::new(FabricState::default()),
        }
    }
}

/// DeviceAdapter over a simulated [`Fabric`]. Device memory is host memory.
///
/// Several adapters may share one fabric; giving them different process ids
/// models devices driven from different processes on the same host.
#[derive(Debug, Clone)]
pub struct HostAdapter {
    fabric: Arc<Fabric>,
    process: ProcessId,
    host: Option<String>,
}

impl HostAdapter {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self {
            fabric,
            process: std::process::id(),
            host: None,
        }
    }

    /// Act as process `process` instead of the current one.
    pub fn with_process(mut self, process: ProcessId) -> Self {
        self.process = process;
        self
    }

    /// Report `host` instead of the fabric's host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }
}

fn release_count<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, usize>,
    key: K,
    what: &str,
) -> Result<()> {
    match map.get_mut(&key) {
        Some(n) if *n > 1 => {
            *n -= 1;
            Ok(())
        }
        Some(_) => {
            map.remove(&key);
            Ok(())
        }
        None => Err(RingError::device(format!("{what} released more often than acquired"))),
    }
}

impl DeviceAdapter for HostAdapter {
    fn device_count(&self) -> usize {
        self.fabric.n_dev
    }

    fn process_id(&self) -> ProcessId {
        self.process
    }

    fn host_id(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| self.fabric.host.clone())
    }

    fn link_class(&self, a: DeviceOrdinal, b: DeviceOrdinal) -> Result<LinkClass> {
        self.fabric.check_device(a)?;
        self.fabric.check_device(b)?;
        if self.fabric.fail_link_query.contains(&pair(a, b)) {
            return Err(RingError::device(format!("link query {a}-{b} failed")));
        }
        Ok(if self.fabric.mesh.contains(&pair(a, b)) {
            LinkClass::Mesh
        } else {
            LinkClass::Pcie
        })
    }

    fn can_access_peer(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<bool> {
        self.fabric.check_device(from)?;
        self.fabric.check_device(to)?;
        if self.fabric.fail_peer_query.contains(&pair(from, to)) {
            return Err(RingError::device(format!("peer query {from}->{to} failed")));
        }
        Ok(from == to || self.fabric.peer.contains(&pair(from, to)))
    }

    fn enable_peer_access(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<()> {
        if self.fabric.fails(FailPoint::PeerAccess { from, to }) || !self.can_access_peer(from, to)? {
            return Err(RingError::HandleOpenFailed {
                what: "peer mapping",
                from,
                to,
                reason: "peer access refused".into(),
            });
        }
        *self.fabric.state()?.peer_enabled.entry((from, to)).or_default() += 1;
        Ok(())
    }

    fn disable_peer_access(&self, from: DeviceOrdinal, to: DeviceOrdinal) -> Result<()> {
        release_count(&mut self.fabric.state()?.peer_enabled, (from, to), "peer mapping")
    }

    fn alloc_region(&self, request: RegionRequest) -> Result<Arc<TransportRegion>> {
        self.fabric.check_device(request.device)?;
        let location = match request.placement {
            Placement::Device(d) => format!("device {d}"),
            Placement::HostMapped => "pinned host memory".to_string(),
        };
        if self.fabric.fails(FailPoint::AllocRegion {
            device: request.device,
        }) {
            return Err(RingError::AllocationFailed {
                location,
                bytes: request.staging_bytes,
            });
        }
        let staging = StagingBuffer::new(request.staging_bytes, &location)?;
        let id = RegionId(self.fabric.next_region.fetch_add(1, Ordering::Relaxed));
        let region = Arc::new(TransportRegion::new(
            id,
            request.device,
            request.placement,
            staging,
            request.exchange,
            request.op_counter,
        ));
        self.fabric.state()?.regions.insert(id, request.device);
        tracing::trace!(%id, device = request.device, %location, "allocated transport region");
        Ok(region)
    }

    fn free_region(&self, device: DeviceOrdinal, region: RegionId) -> Result<()> {
        let mut state = self.fabric.state()?;
        match state.regions.remove(&region) {
            Some(owner) if owner == device => {
                state.exports.remove(&region);
                Ok(())
            }
            Some(owner) => {
                state.regions.insert(region, owner);
                Err(RingError::device(format!(
                    "{region} belongs to device {owner}, not {device}"
                )))
            }
            None => Err(RingError::device(format!("{region} freed twice"))),
        }
    }

    fn ipc_export(&self, region: &Arc<TransportRegion>) -> Result<IpcMemHandle> {
        let device = region.owner();
        if region.placement() == Placement::HostMapped {
            return Err(RingError::device(format!(
                "{} is host memory and cannot be exported",
                region.id()
            )));
        }
        if self.fabric.fails(FailPoint::IpcExport { device }) {
            return Err(RingError::device(format!("ipc export on device {device} failed")));
        }
        self.fabric
            .state()?
            .exports
            .insert(region.id(), Arc::clone(region));
        Ok(IpcMemHandle {
            region: region.id(),
            device,
            process: self.process,
        })
    }

    fn ipc_open(
        &self,
        device: DeviceOrdinal,
        handle: &IpcMemHandle,
    ) -> Result<Arc<TransportRegion>> {
        let fail = |reason: &str| RingError::HandleOpenFailed {
            what: "ipc handle",
            from: device,
            to: handle.device,
            reason: reason.to_string(),
        };
        if self.fabric.fails(FailPoint::IpcOpen { device }) {
            return Err(fail("open refused"));
        }
        if handle.process == self.process {
            return Err(fail("handle was exported by this process"));
        }
        let mut state = self.fabric.state()?;
        let region = state
            .exports
            .get(&handle.region)
            .cloned()
            .ok_or_else(|| fail("region no longer exported"))?;
        *state.ipc_opened.entry((device, handle.region)).or_default() += 1;
        Ok(region)
    }

    fn ipc_close(&self, device: DeviceOrdinal, region: RegionId) -> Result<()> {
        release_count(&mut self.fabric.state()?.ipc_opened, (device, region), "ipc handle")
    }

    fn host_map(&self, device: DeviceOrdinal, region: &Arc<TransportRegion>) -> Result<()> {
        let fail = |reason: &str| RingError::HandleOpenFailed {
            what: "host mapping",
            from: device,
            to: region.owner(),
            reason: reason.to_string(),
        };
        if self.fabric.fails(FailPoint::HostMap { device }) {
            return Err(fail("mapping refused"));
        }
        if region.placement() != Placement::HostMapped {
            return Err(fail("region is not in host memory"));
        }
        *self
            .fabric
            .state()?
            .host_maps
            .entry((device, region.id()))
            .or_default() += 1;
        Ok(())
    }

    fn host_unmap(&self, device: DeviceOrdinal, region: RegionId) -> Result<()> {
        release_count(&mut self.fabric.state()?.host_maps, (device, region), "host mapping")
    }
}
