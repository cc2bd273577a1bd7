//! Ring construction and neighbor transport selection.

pub mod table;

use std::str::FromStr;

use crate::config::RingConfig;
use crate::device::{DeviceAdapter, LinkClass};
use crate::error::{Result, RingError};
use crate::rendezvous::PeerInfo;
use crate::types::{DeviceOrdinal, MAX_RINGS, Rank};

pub use table::TopologyTable;

/// Interconnect shapes with hand-tuned ring tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyId {
    /// PCIe only: a single naive ring in rank order.
    Pcie,
    /// Eight devices in two linked quads (hybrid cube mesh).
    CubeMesh,
    /// Eight devices, cube mesh with a rotated cross-quad pairing.
    BigBasin,
    /// One fully linked quad of four devices.
    HalfCubeMesh,
    /// Every device linked to every other.
    FullyConnected,
}

impl TopologyId {
    pub const fn name(self) -> &'static str {
        match self {
            TopologyId::Pcie => "pcie",
            TopologyId::CubeMesh => "cube-mesh",
            TopologyId::BigBasin => "big-basin",
            TopologyId::HalfCubeMesh => "half-cube-mesh",
            TopologyId::FullyConnected => "fully-connected",
        }
    }

    /// Mesh topologies carry every ring in both directions.
    pub const fn is_link_rich(self) -> bool {
        !matches!(self, TopologyId::Pcie)
    }
}

impl std::fmt::Display for TopologyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TopologyId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "pcie" | "ring" => Ok(TopologyId::Pcie),
            "cube-mesh" => Ok(TopologyId::CubeMesh),
            "big-basin" | "bigbasin" => Ok(TopologyId::BigBasin),
            "half-cube-mesh" => Ok(TopologyId::HalfCubeMesh),
            "fully-connected" => Ok(TopologyId::FullyConnected),
            other => Err(format!("unknown topology '{other}'")),
        }
    }
}

/// How a device reaches its ring successor's transport region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportClass {
    /// Successor is the same physical device in the same process.
    SameDevice,
    /// Successor's device memory is directly addressable.
    PeerMapped,
    /// Successor's device memory is opened through an inter-process handle.
    Ipc,
    /// Successor's region lives in host memory mapped into both devices.
    SharedHost,
}

impl std::fmt::Display for TransportClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportClass::SameDevice => "same-device",
            TransportClass::PeerMapped => "peer",
            TransportClass::Ipc => "ipc",
            TransportClass::SharedHost => "host",
        })
    }
}

/// One ring: the order in which ranks pass data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    index: usize,
    user_from_ring: Vec<Rank>,
    ring_from_user: Vec<usize>,
}

impl Ring {
    /// Build a ring from ranks in ring order. Fails unless the order visits
    /// every rank in `0..n` exactly once.
    pub fn new(index: usize, user_from_ring: Vec<Rank>) -> Result<Self> {
        let n = user_from_ring.len();
        let mut ring_from_user = vec![usize::MAX; n];
        for (pos, &rank) in user_from_ring.iter().enumerate() {
            let slot = ring_from_user.get_mut(rank as usize).ok_or_else(|| {
                RingError::Internal(format!("ring {index}: rank {rank} outside 0..{n}"))
            })?;
            if *slot != usize::MAX {
                return Err(RingError::Internal(format!(
                    "ring {index}: rank {rank} placed twice"
                )));
            }
            *slot = pos;
        }
        let ring = Self {
            index,
            user_from_ring,
            ring_from_user,
        };
        if !ring.is_single_cycle() {
            return Err(RingError::Internal(format!(
                "ring {index} does not form a single cycle"
            )));
        }
        Ok(ring)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.user_from_ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_from_ring.is_empty()
    }

    /// Rank at ring position `pos`.
    pub fn user_at(&self, pos: usize) -> Rank {
        self.user_from_ring[pos % self.len()]
    }

    /// Ring position of `rank`.
    pub fn position_of(&self, rank: Rank) -> usize {
        self.ring_from_user[rank as usize]
    }

    pub fn next_of(&self, rank: Rank) -> Rank {
        self.user_at(self.position_of(rank) + 1)
    }

    pub fn prev_of(&self, rank: Rank) -> Rank {
        self.user_at(self.position_of(rank) + self.len() - 1)
    }

    pub fn user_from_ring(&self) -> &[Rank] {
        &self.user_from_ring
    }

    pub fn ring_from_user(&self) -> &[usize] {
        &self.ring_from_user
    }

    /// Rank whose block the device at ring position `pos` handles at `step`.
    ///
    /// At the final step this is the device's own rank.
    pub fn block_at(&self, pos: usize, step: usize) -> Rank {
        let n = self.len();
        self.user_at((n + pos - 1 - step % n) % n)
    }

    fn is_single_cycle(&self) -> bool {
        let n = self.len();
        if n == 0 {
            return false;
        }
        let mut rank = self.user_from_ring[0];
        for hops in 1..=n {
            rank = self.next_of(rank);
            if rank == self.user_from_ring[0] {
                return hops == n;
            }
        }
        false
    }
}

/// The rings selected for a communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSet {
    pub topology: TopologyId,
    pub rings: Vec<Ring>,
}

/// Devices in ordinal order, deduplicated. A table slot is an index here.
fn slots_of(peers: &[PeerInfo]) -> Vec<DeviceOrdinal> {
    let mut devices: Vec<DeviceOrdinal> = peers.iter().map(|p| p.device).collect();
    devices.sort_unstable();
    devices.dedup();
    devices
}

/// Classify the interconnect of the participating devices.
///
/// Devices in several processes or hosts, or appearing more than once, get
/// the naive ring. Otherwise the first table whose links are all present as
/// mesh links wins.
pub fn detect_topology(
    adapter: &dyn DeviceAdapter,
    peers: &[PeerInfo],
    config: &RingConfig,
) -> TopologyId {
    let slots = slots_of(peers);
    let single_host = peers.windows(2).all(|w| w[0].host == w[1].host);
    if slots.len() != peers.len() || slots.len() < 2 || !single_host {
        return TopologyId::Pcie;
    }

    let n = slots.len();
    let mut mesh = vec![vec![false; n]; n];
    let mut any_mesh = false;
    for a in 0..n {
        for b in (a + 1)..n {
            let linked = match adapter.link_class(slots[a], slots[b]) {
                Ok(LinkClass::Mesh) => true,
                Ok(LinkClass::Pcie) => false,
                Err(e) => {
                    config.warn(format_args!(
                        "link query {}-{} failed, assuming PCIe: {e}",
                        slots[a], slots[b]
                    ));
                    false
                }
            };
            mesh[a][b] = linked;
            mesh[b][a] = linked;
            any_mesh |= linked;
        }
    }
    if !any_mesh {
        return TopologyId::Pcie;
    }

    table::all()
        .filter(|t| t.n_dev == n)
        .find(|t| t.links.iter().all(|&(a, b)| mesh[a][b]))
        .map(|t| t.id)
        .unwrap_or(TopologyId::Pcie)
}

/// Build the rings for the given peers (indexed by rank).
///
/// Uses the table for the detected (or configured) topology when one exists
/// for this device count, doubling rings on link-rich topologies, and the
/// naive rank-order ring otherwise.
pub fn build_rings(
    adapter: &dyn DeviceAdapter,
    peers: &[PeerInfo],
    config: &RingConfig,
) -> Result<RingSet> {
    let n = peers.len();
    if n == 0 {
        return Err(RingError::UnsupportedDeviceCount { n_dev: 0 });
    }
    let topology = config
        .topology
        .unwrap_or_else(|| detect_topology(adapter, peers, config));
    let slots = slots_of(peers);
    let max_rings = config.max_rings.clamp(1, MAX_RINGS);

    let table = match table::lookup(topology, n) {
        Some(t) if slots.len() == n => Some(t),
        Some(_) => {
            config.warn(format_args!(
                "{topology} table needs {n} distinct devices; using naive ring"
            ));
            None
        }
        None => None,
    };

    let Some(table) = table else {
        let naive: Vec<Rank> = (0..n as Rank).collect();
        return Ok(RingSet {
            topology: TopologyId::Pcie,
            rings: vec![Ring::new(0, naive)?],
        });
    };

    let mut orders: Vec<Vec<usize>> = table.rings.clone();
    if topology.is_link_rich() {
        let reversed: Vec<Vec<usize>> = table
            .rings
            .iter()
            .map(|r| {
                let mut rev = vec![r[0]];
                rev.extend(r[1..].iter().rev());
                rev
            })
            .collect();
        for rev in reversed {
            if !orders.contains(&rev) {
                orders.push(rev);
            }
        }
    }
    orders.truncate(max_rings);

    let rank_of_slot: Vec<Rank> = slots
        .iter()
        .map(|&dev| {
            peers
                .iter()
                .find(|p| p.device == dev)
                .map(|p| p.rank)
                .ok_or_else(|| RingError::Internal(format!("device {dev} has no rank")))
        })
        .collect::<Result<_>>()?;

    let rings = orders
        .iter()
        .enumerate()
        .map(|(idx, order)| {
            let users = order
                .iter()
                .map(|&slot| {
                    rank_of_slot.get(slot).copied().ok_or_else(|| {
                        RingError::Internal(format!("slot {slot} cannot be placed"))
                    })
                })
                .collect::<Result<Vec<Rank>>>()?;
            Ring::new(idx, users)
        })
        .collect::<Result<Vec<Ring>>>()?;

    Ok(RingSet { topology, rings })
}

/// Pick how `me` writes into `next`'s transport region.
///
/// A failing capability query falls back to host memory.
pub fn transport_class(
    adapter: &dyn DeviceAdapter,
    me: &PeerInfo,
    next: &PeerInfo,
    config: &RingConfig,
) -> TransportClass {
    let same_process = me.process == next.process && me.host == next.host;
    if me.device == next.device && same_process {
        return TransportClass::SameDevice;
    }
    if me.host != next.host {
        return TransportClass::SharedHost;
    }
    let peer = if me.device == next.device {
        true
    } else {
        match adapter.can_access_peer(me.device, next.device) {
            Ok(ok) => ok,
            Err(e) => {
                config.warn(format_args!(
                    "peer query {}->{} failed, using host memory: {e}",
                    me.device, next.device
                ));
                false
            }
        }
    };
    match (peer, same_process) {
        (true, true) => TransportClass::PeerMapped,
        (true, false) => TransportClass::Ipc,
        (false, _) => TransportClass::SharedHost,
    }
}
