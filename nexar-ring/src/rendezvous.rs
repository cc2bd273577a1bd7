//! Construction-time rendezvous between the ranks of one communicator.
//!
//! Ranks that share a [`UniqueId`] meet in a segment looked up in a
//! process-wide registry. The segment exists only while construction is in
//! progress; the last participant to leave unlinks it. Three phases run in
//! order: peer info exchange, region export exchange, and a final barrier
//! after every rank has opened its successor handles.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_utils::Backoff;

use crate::error::{Result, RingError};
use crate::handle::RegionExport;
use crate::types::{DeviceOrdinal, ProcessId, Rank};

/// Session identifier shared out-of-band by all ranks of a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId(u64);

impl UniqueId {
    /// A fresh id, unique within this process and very likely across hosts.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut hasher = DefaultHasher::new();
        std::process::id().hash(&mut hasher);
        COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What each rank tells its peers about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub rank: Rank,
    pub device: DeviceOrdinal,
    pub process: ProcessId,
    pub host: String,
    pub n_dev: usize,
    pub buffer_size: usize,
}

const PHASES: usize = 3;
const PHASE_PEERS: usize = 0;
const PHASE_EXPORTS: usize = 1;
const PHASE_FINISH: usize = 2;

#[derive(Debug, Default)]
struct SegmentData {
    peers: Vec<Option<PeerInfo>>,
    exports: Vec<Option<Vec<RegionExport>>>,
}

#[derive(Debug)]
struct Segment {
    n_dev: usize,
    arrived: [AtomicUsize; PHASES],
    joined: AtomicUsize,
    left: AtomicUsize,
    aborted: AtomicBool,
    data: Mutex<SegmentData>,
}

impl Segment {
    fn new(n_dev: usize) -> Self {
        Self {
            n_dev,
            arrived: Default::default(),
            joined: AtomicUsize::new(0),
            left: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            data: Mutex::new(SegmentData {
                peers: vec![None; n_dev],
                exports: vec![None; n_dev],
            }),
        }
    }

    fn data(&self) -> Result<MutexGuard<'_, SegmentData>> {
        self.data
            .lock()
            .map_err(|_| RingError::LockPoisoned("rendezvous segment"))
    }
}

static SEGMENTS: LazyLock<Mutex<HashMap<UniqueId, Arc<Segment>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> Result<MutexGuard<'static, HashMap<UniqueId, Arc<Segment>>>> {
    SEGMENTS
        .lock()
        .map_err(|_| RingError::LockPoisoned("rendezvous registry"))
}

/// One rank's membership in a rendezvous segment.
///
/// Dropping a membership that did not [`finish`](Self::finish) marks the
/// segment aborted so that peers stop waiting.
#[derive(Debug)]
pub struct Rendezvous {
    id: UniqueId,
    rank: Rank,
    segment: Arc<Segment>,
    timeout: Duration,
    finished: bool,
}

impl Rendezvous {
    /// Join (creating if needed) the segment for `id`.
    pub fn join(id: UniqueId, rank: Rank, n_dev: usize, timeout: Duration) -> Result<Self> {
        let segment = {
            let mut segments = registry()?;
            let segment = Arc::clone(
                segments
                    .entry(id)
                    .or_insert_with(|| Arc::new(Segment::new(n_dev))),
            );
            segment.joined.fetch_add(1, Ordering::AcqRel);
            segment
        };
        let rdv = Self {
            id,
            rank,
            segment,
            timeout,
            finished: false,
        };
        if rdv.segment.n_dev != n_dev {
            return Err(RingError::PeerMismatch {
                rank,
                field: "device count",
                local: n_dev,
                remote: rdv.segment.n_dev,
            });
        }
        Ok(rdv)
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    /// Publish this rank's info and collect everyone's, indexed by rank.
    pub fn exchange_peers(&self, me: PeerInfo) -> Result<Vec<PeerInfo>> {
        {
            let mut data = self.segment.data()?;
            let slot = data
                .peers
                .get_mut(self.rank as usize)
                .ok_or(RingError::InvalidRank {
                    rank: self.rank,
                    n_dev: self.segment.n_dev,
                })?;
            if slot.is_some() {
                return Err(RingError::Internal(format!(
                    "rank {} joined rendezvous {} twice",
                    self.rank, self.id
                )));
            }
            *slot = Some(me);
        }
        self.arrive_and_wait(PHASE_PEERS)?;
        let data = self.segment.data()?;
        data.peers
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RingError::Internal("peer slot empty after barrier".into()))
    }

    /// Publish this rank's region exports (one per ring) and collect
    /// everyone's, indexed by rank.
    pub fn exchange_exports(&self, exports: Vec<RegionExport>) -> Result<Vec<Vec<RegionExport>>> {
        {
            let mut data = self.segment.data()?;
            if let Some(slot) = data.exports.get_mut(self.rank as usize) {
                *slot = Some(exports);
            }
        }
        self.arrive_and_wait(PHASE_EXPORTS)?;
        let data = self.segment.data()?;
        data.exports
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RingError::Internal("export slot empty after barrier".into()))
    }

    /// Final barrier: every rank has opened its handles.
    pub fn finish(mut self) -> Result<()> {
        self.arrive_and_wait(PHASE_FINISH)?;
        self.finished = true;
        Ok(())
    }

    /// Tell every peer that construction failed on this rank.
    pub fn abort(&self) {
        if !self.segment.aborted.swap(true, Ordering::AcqRel) {
            tracing::debug!(session = %self.id, rank = self.rank, "rendezvous aborted");
        }
    }

    fn arrive_and_wait(&self, phase: usize) -> Result<()> {
        let counter = &self.segment.arrived[phase];
        let n_dev = self.segment.n_dev;
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= n_dev {
                return Err(RingError::Internal(format!(
                    "more than {n_dev} ranks arrived at rendezvous {}",
                    self.id
                )));
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        let deadline = Instant::now() + self.timeout;
        let backoff = Backoff::new();
        loop {
            if self.segment.aborted.load(Ordering::Acquire) {
                return Err(RingError::RendezvousAborted {
                    session: self.id.as_raw(),
                });
            }
            let arrived = counter.load(Ordering::Acquire);
            if arrived == n_dev {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RingError::RendezvousTimeout {
                    session: self.id.as_raw(),
                    arrived,
                    expected: n_dev,
                });
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
        // Joins and leaves are ordered by the registry lock, so the last one
        // out sees every participant.
        let Ok(mut segments) = registry() else {
            return;
        };
        let left = self.segment.left.fetch_add(1, Ordering::AcqRel) + 1;
        if left == self.segment.joined.load(Ordering::Acquire)
            && segments
                .get(&self.id)
                .is_some_and(|s| Arc::ptr_eq(s, &self.segment))
        {
            segments.remove(&self.id);
        }
    }
}

/// True while a segment for `id` is linked in the registry.
pub fn is_linked(id: UniqueId) -> bool {
    registry().is_ok_and(|s| s.contains_key(&id))
}
