//! Communicator construction and teardown.
//!
//! A communicator is one rank's view of a ring group of devices: its rings,
//! the transport region it owns on each ring, and a handle to each ring
//! successor's region. Construction either fully succeeds or releases
//! everything it acquired.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RingConfig;
use crate::device::{DeviceAdapter, RegionRequest};
use crate::error::{Result, RingError};
use crate::handle::{HandleKind, RegionExport, RegionHandle};
use crate::kernel::RingLinkView;
use crate::region::{ExchangeSlot, OpCounter, Placement, TransportRegion};
use crate::rendezvous::{PeerInfo, Rendezvous, UniqueId};
use crate::topology::{Ring, TopologyId, TransportClass, build_rings, transport_class};
use crate::types::{DeviceOrdinal, Rank};

/// This device's two regions on one ring.
#[derive(Debug)]
struct RingLink {
    own: RegionHandle,
    next: RegionHandle,
    class: TransportClass,
}

/// One rank of a reduce-scatter ring group.
#[derive(Debug)]
pub struct Communicator {
    rank: Rank,
    n_dev: usize,
    device: DeviceOrdinal,
    config: RingConfig,
    adapter: Arc<dyn DeviceAdapter>,
    topology: TopologyId,
    rings: Vec<Ring>,
    links: Vec<RingLink>,
    op_counter: Arc<OpCounter>,
    op_sched: AtomicU64,
}

impl Communicator {
    /// Create rank `rank` of an `n_dev`-rank communicator on `device`.
    ///
    /// Every rank calls this with the same `id` and `n_dev`; the call returns
    /// once all of them have wired their rings.
    pub fn init_rank(
        n_dev: usize,
        id: UniqueId,
        rank: Rank,
        device: DeviceOrdinal,
        adapter: Arc<dyn DeviceAdapter>,
        config: RingConfig,
    ) -> Result<Self> {
        config.validate()?;
        if n_dev == 0 {
            return Err(RingError::UnsupportedDeviceCount { n_dev });
        }
        if rank as usize >= n_dev {
            return Err(RingError::InvalidRank { rank, n_dev });
        }
        if device >= adapter.device_count() {
            return Err(RingError::InvalidConfig(format!(
                "device {device} not present ({} visible)",
                adapter.device_count()
            )));
        }

        let rdv = Rendezvous::join(id, rank, n_dev, config.rendezvous_timeout)?;
        let me = PeerInfo {
            rank,
            device,
            process: adapter.process_id(),
            host: adapter.host_id(),
            n_dev,
            buffer_size: config.buffer_size,
        };
        let peers = rdv.exchange_peers(me.clone())?;
        check_peers(&me, &peers)?;

        let ring_set = build_rings(adapter.as_ref(), &peers, &config)?;
        config.info(format_args!(
            "rank {rank}: {} ring(s) over {} topology",
            ring_set.rings.len(),
            ring_set.topology
        ));

        let op_counter = Arc::new(OpCounter::new());
        let mut owned = Vec::with_capacity(ring_set.rings.len());
        let mut exports = Vec::with_capacity(ring_set.rings.len());
        for ring in &ring_set.rings {
            let prev = &peers[ring.prev_of(rank) as usize];
            let class = transport_class(adapter.as_ref(), prev, &me, &config);
            let placement = match class {
                TransportClass::SharedHost => Placement::HostMapped,
                _ => Placement::Device(device),
            };
            let region = adapter.alloc_region(RegionRequest {
                device,
                placement,
                staging_bytes: config.buffer_size,
                exchange: ExchangeSlot {
                    rank,
                    n_dev,
                    buffer_size: config.buffer_size,
                },
                op_counter: Arc::clone(&op_counter),
            })?;
            owned.push(RegionHandle::new(
                HandleKind::Owned,
                device,
                Arc::clone(&region),
                Arc::clone(&adapter),
            ));
            exports.push(match class {
                TransportClass::Ipc => RegionExport::Ipc(adapter.ipc_export(&region)?),
                TransportClass::SharedHost => RegionExport::Host(region),
                TransportClass::SameDevice | TransportClass::PeerMapped => {
                    RegionExport::Direct(region)
                }
            });
        }

        let all_exports = rdv.exchange_exports(exports)?;

        let mut links = Vec::with_capacity(ring_set.rings.len());
        for (ring, own) in ring_set.rings.iter().zip(owned) {
            let next = &peers[ring.next_of(rank) as usize];
            let class = transport_class(adapter.as_ref(), &me, next, &config);
            let export = all_exports
                .get(next.rank as usize)
                .and_then(|e| e.get(ring.index()))
                .ok_or_else(|| {
                    RingError::Internal(format!(
                        "rank {} published no region for ring {}",
                        next.rank,
                        ring.index()
                    ))
                })?;
            let next_handle = open_successor(&adapter, device, next, class, export)?;
            check_exchange(next, next_handle.region().exchange())?;
            tracing::debug!(
                rank,
                ring = ring.index(),
                next = next.rank,
                %class,
                "connected to ring successor"
            );
            links.push(RingLink {
                own,
                next: next_handle,
                class,
            });
        }

        rdv.finish()?;

        tracing::info!(
            rank,
            n_dev,
            device,
            topology = %ring_set.topology,
            rings = links.len(),
            "communicator ready"
        );

        Ok(Self {
            rank,
            n_dev,
            device,
            config,
            adapter,
            topology: ring_set.topology,
            rings: ring_set.rings,
            links,
            op_counter,
            op_sched: AtomicU64::new(0),
        })
    }

    /// Create one communicator per listed device from a single process.
    ///
    /// Rank `i` runs on `devices[i]`; a device may appear more than once.
    pub fn init_all(
        devices: &[DeviceOrdinal],
        adapter: Arc<dyn DeviceAdapter>,
        config: RingConfig,
    ) -> Result<Vec<Self>> {
        let n_dev = devices.len();
        if n_dev == 0 {
            return Err(RingError::UnsupportedDeviceCount { n_dev });
        }
        let id = UniqueId::new();
        let results: Vec<Result<Self>> = std::thread::scope(|s| {
            let handles: Vec<_> = devices
                .iter()
                .enumerate()
                .map(|(rank, &device)| {
                    let adapter = Arc::clone(&adapter);
                    let config = config.clone();
                    s.spawn(move || {
                        Self::init_rank(n_dev, id, rank as Rank, device, adapter, config)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(RingError::device("communicator init panicked")))
                })
                .collect()
        });

        let mut comms = Vec::with_capacity(n_dev);
        let mut root_cause: Option<RingError> = None;
        for result in results {
            match result {
                Ok(comm) => comms.push(comm),
                Err(e) => {
                    // Peers of the failing rank only report the abort.
                    let replace = root_cause.as_ref().is_none_or(|cur| {
                        matches!(cur, RingError::RendezvousAborted { .. })
                            && !matches!(e, RingError::RendezvousAborted { .. })
                    });
                    if replace {
                        root_cause = Some(e);
                    }
                }
            }
        }
        match root_cause {
            Some(e) => Err(e),
            None => Ok(comms),
        }
    }

    /// Release every mapping and region. Equivalent to dropping, but
    /// reports the first release failure.
    pub fn destroy(mut self) -> Result<()> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for link in self.links.drain(..) {
            for handle in [link.next, link.own] {
                if let Err(e) = handle.release()
                    && first_err.is_none()
                {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn n_dev(&self) -> usize {
        self.n_dev
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    pub fn n_rings(&self) -> usize {
        self.rings.len()
    }

    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    /// How this rank reaches its successor on each ring.
    pub fn transport_classes(&self) -> Vec<TransportClass> {
        self.links.iter().map(|l| l.class).collect()
    }

    /// Handle kinds of the successor regions, one per ring.
    pub fn successor_handles(&self) -> Vec<HandleKind> {
        self.links.iter().map(|l| l.next.kind()).collect()
    }

    /// The transport region this rank owns on ring `ring`.
    pub fn own_region(&self, ring: usize) -> Option<&TransportRegion> {
        self.links.get(ring).map(|l| l.own.region())
    }

    /// Staging bytes per ring.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn DeviceAdapter> {
        &self.adapter
    }

    /// Collectives fully retired by this rank.
    pub fn completed_ops(&self) -> u64 {
        self.op_counter.value()
    }

    pub(crate) fn op_counter(&self) -> &OpCounter {
        &self.op_counter
    }

    /// Claim the index of the next collective.
    pub(crate) fn next_op_index(&self) -> u64 {
        self.op_sched.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn link_views(&self) -> Vec<RingLinkView<'_>> {
        self.links
            .iter()
            .map(|l| RingLinkView {
                own: l.own.region(),
                next: l.next.region(),
            })
            .collect()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::warn!(rank = self.rank, "communicator teardown failed: {e}");
        }
    }
}

fn check_peers(me: &PeerInfo, peers: &[PeerInfo]) -> Result<()> {
    for peer in peers {
        if peer.n_dev != me.n_dev {
            return Err(RingError::PeerMismatch {
                rank: peer.rank,
                field: "device count",
                local: me.n_dev,
                remote: peer.n_dev,
            });
        }
        if peer.buffer_size != me.buffer_size {
            return Err(RingError::PeerMismatch {
                rank: peer.rank,
                field: "buffer size",
                local: me.buffer_size,
                remote: peer.buffer_size,
            });
        }
    }
    Ok(())
}

fn check_exchange(next: &PeerInfo, slot: ExchangeSlot) -> Result<()> {
    if slot.rank != next.rank {
        return Err(RingError::Internal(format!(
            "region of rank {} is tagged with rank {}",
            next.rank, slot.rank
        )));
    }
    if slot.n_dev != next.n_dev {
        return Err(RingError::PeerMismatch {
            rank: next.rank,
            field: "device count",
            local: next.n_dev,
            remote: slot.n_dev,
        });
    }
    if slot.buffer_size != next.buffer_size {
        return Err(RingError::PeerMismatch {
            rank: next.rank,
            field: "buffer size",
            local: next.buffer_size,
            remote: slot.buffer_size,
        });
    }
    Ok(())
}

fn open_successor(
    adapter: &Arc<dyn DeviceAdapter>,
    device: DeviceOrdinal,
    next: &PeerInfo,
    class: TransportClass,
    export: &RegionExport,
) -> Result<RegionHandle> {
    let (kind, region) = match (class, export) {
        (TransportClass::SameDevice, RegionExport::Direct(r)) => {
            (HandleKind::Aliased, Arc::clone(r))
        }
        (TransportClass::PeerMapped, RegionExport::Direct(r)) => {
            adapter.enable_peer_access(device, next.device)?;
            (
                HandleKind::PeerMapped { peer: next.device },
                Arc::clone(r),
            )
        }
        (TransportClass::Ipc, RegionExport::Ipc(h)) => {
            (HandleKind::IpcOpened, adapter.ipc_open(device, h)?)
        }
        (TransportClass::SharedHost, RegionExport::Host(r)) => {
            adapter.host_map(device, r)?;
            (HandleKind::SharedHost, Arc::clone(r))
        }
        (class, _) => {
            return Err(RingError::Internal(format!(
                "rank {} exported a region unusable over {class} transport",
                next.rank
            )));
        }
    };
    Ok(RegionHandle::new(kind, device, region, Arc::clone(adapter)))
}
