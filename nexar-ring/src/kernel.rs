//! The ring reduce-scatter kernel.
//!
//! One ring group runs per active ring: `producers` threads that move and
//! combine data, plus one signaling thread that publishes flags. The group
//! walks a precomputed [`RingSchedule`] in lockstep, two barriers per stage:
//!
//! ```text
//!   producer 0 waits (op gate, chunk done, new data)
//!   ── barrier ──
//!   all producers copy/reduce their share of the stage
//!   ── barrier ──
//!   signaler posts ready / done
//! ```
//!
//! A worker that panics marks its group failed and keeps arriving at both
//! barriers without touching data, so its siblings and the peer devices
//! still run the protocol to the end. The launch then reports a `Device`
//! error.
//!
//! At step 0 a device copies its input block into the successor's staging
//! buffer. At steps `1..D-1` it combines what the predecessor staged with its
//! own input and forwards the result. At step `D-1` the result is final and
//! lands in the device's own output.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, RingError};
use crate::plan::PartitionPlan;
use crate::reduce::{copy_elems, reduce_elems};
use crate::region::{OpCounter, TransportRegion};
use crate::topology::Ring;
use crate::types::{DataType, NUM_BUFCHUNKS, Rank, ReduceOp, UNROLL};

/// One pipeline stage of one ring group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Index of the chunk among those this ring handles.
    pub local_chunk: usize,
    pub step: usize,
    /// Rank whose block this stage works on.
    pub block: Rank,
    /// Element offset within the block.
    pub offset: usize,
    pub len: usize,
    /// Element offset in the device's own staging buffer to combine from.
    pub read_at: Option<usize>,
    /// Element offset in the successor's staging buffer to write to; `None`
    /// writes to the device's output.
    pub write_at: Option<usize>,
    pub wait_done: Option<u64>,
    pub wait_ready: Option<u64>,
    pub post_ready: Option<u64>,
    pub post_done: Option<u64>,
}

/// Every stage one device executes on one ring for one collective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSchedule {
    pub ring: usize,
    pub rank: Rank,
    pub stages: Vec<Stage>,
}

impl RingSchedule {
    /// Schedule for `rank` on `ring`, which handles chunks `group`,
    /// `group + R`, ... of `plan`.
    pub fn new(plan: &PartitionPlan, ring: &Ring, group: usize, rank: Rank) -> Self {
        let n = ring.len();
        let pos = ring.position_of(rank);
        let chunks: Vec<usize> = plan.chunks_of_ring(group).collect();
        let n_local = chunks.len();

        let mut stages = Vec::new();
        let mut seq = 0u64;
        for (local, &c) in chunks.iter().enumerate() {
            let geom = plan.chunk(c);
            let n_subs = geom.subchunks.len() as u64;
            let last_sub = geom.subchunks.len().saturating_sub(1);
            for step in 0..n {
                let block = ring.block_at(pos, step);
                for (j, sub) in geom.subchunks.iter().enumerate() {
                    let s = step as u64;
                    let j64 = j as u64;
                    stages.push(Stage {
                        local_chunk: local,
                        step,
                        block,
                        offset: geom.offset + sub.offset,
                        len: sub.len,
                        read_at: (step > 0)
                            .then(|| plan.staging_offset(local, step - 1, sub.offset)),
                        write_at: (step + 1 < n)
                            .then(|| plan.staging_offset(local, step, sub.offset)),
                        wait_done: (step == 0 && j == 0 && local >= NUM_BUFCHUNKS)
                            .then(|| (local + 1 - NUM_BUFCHUNKS) as u64),
                        wait_ready: (step > 0).then(|| seq + (s - 1) * n_subs + j64 + 1),
                        post_ready: (step + 1 < n).then(|| seq + s * n_subs + j64 + 1),
                        post_done: (step + 1 == n && j == last_sub && local + 1 < n_local)
                            .then(|| (local + 1) as u64),
                    });
                }
            }
            seq += (n as u64 - 1) * n_subs;
        }

        Self {
            ring: ring.index(),
            rank,
            stages,
        }
    }
}

/// Raw buffer pointer shared by the workers of a ring group.
///
/// Workers write disjoint ranges; the pointer outlives the scoped threads.
#[derive(Clone, Copy)]
struct RawBuf(*mut u8);

unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

/// One ring's regions as seen by this device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingLinkView<'a> {
    pub own: &'a TransportRegion,
    pub next: &'a TransportRegion,
}

/// Arguments of one kernel launch on one device.
pub(crate) struct Launch<'a> {
    pub rank: Rank,
    pub rings: &'a [Ring],
    pub links: Vec<RingLinkView<'a>>,
    pub op_counter: &'a OpCounter,
    pub plan: &'a PartitionPlan,
    pub dtype: DataType,
    pub op: ReduceOp,
    pub op_index: u64,
    pub producers: usize,
}

struct GroupCtx<'a> {
    schedule: RingSchedule,
    link: RingLinkView<'a>,
    op_counter: &'a OpCounter,
    n_groups: usize,
    send: RawBuf,
    recv: RawBuf,
    count: usize,
    elem: usize,
    dtype: DataType,
    op: ReduceOp,
    op_index: u64,
    producers: usize,
    barrier: Barrier,
    failed: AtomicBool,
}

impl GroupCtx<'_> {
    /// Run `f` unless the group already failed; a panic in it fails the group.
    fn guarded(&self, f: impl FnOnce()) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            self.failed.store(true, Ordering::Relaxed);
        }
    }

    fn producer<W>(&self, p: usize, work: &W)
    where
        W: Fn(&GroupCtx<'_>, &Stage, usize) + Sync,
    {
        for (i, stage) in self.schedule.stages.iter().enumerate() {
            if p == 0 {
                if i == 0 {
                    self.link.next.op_counter().wait_for(self.op_index);
                }
                if let Some(v) = stage.wait_done {
                    self.link.next.done().wait(v);
                }
                if let Some(v) = stage.wait_ready {
                    self.link.own.ready().wait(v);
                }
            }
            self.barrier.wait();
            self.guarded(|| work(self, stage, p));
            self.barrier.wait();
        }
    }

    fn signaler(&self) -> bool {
        for stage in &self.schedule.stages {
            self.barrier.wait();
            self.barrier.wait();
            // Posts go out even after a failure so that peers do not stall.
            let posted = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(v) = stage.post_ready {
                    self.link.next.ready().post(v);
                }
                if let Some(v) = stage.post_done {
                    self.link.own.done().post(v);
                }
            }));
            if posted.is_err() {
                self.failed.store(true, Ordering::Relaxed);
            }
        }
        self.link.own.reset_flags();
        self.op_counter.retire_group(self.n_groups, self.op_index)
    }

    unsafe fn apply(&self, stage: &Stage, p: usize) {
        let per = stage.len.div_ceil(self.producers).next_multiple_of(UNROLL);
        let lo = (p * per).min(stage.len);
        let hi = (lo + per).min(stage.len);
        if lo == hi {
            return;
        }
        let e = self.elem;
        let n = hi - lo;
        unsafe {
            let local = self
                .send
                .0
                .add((stage.block as usize * self.count + stage.offset + lo) * e);
            let dst = match stage.write_at {
                Some(at) => self.link.next.staging_ptr().add((at + lo) * e),
                None => self.recv.0.add((stage.offset + lo) * e),
            };
            match stage.read_at {
                None => copy_elems(dst, local, n, self.dtype),
                Some(at) => {
                    let acc = self.link.own.staging_ptr().add((at + lo) * e);
                    reduce_elems(dst, acc, local, n, self.dtype, self.op);
                }
            }
        }
    }
}

/// Run one reduce-scatter on this device across all active rings.
///
/// `send` holds `n_dev * count` elements, `recv` holds `count`.
pub(crate) fn run(launch: Launch<'_>, send: &[u8], recv: &mut [u8]) -> Result<()> {
    // SAFETY: stage offsets stay inside the buffers the plan was built for;
    // producers touch disjoint element ranges.
    run_groups(launch, send, recv, &|ctx: &GroupCtx<'_>, stage: &Stage, p: usize| unsafe {
        ctx.apply(stage, p)
    })
}

fn run_groups<W>(launch: Launch<'_>, send: &[u8], recv: &mut [u8], work: &W) -> Result<()>
where
    W: Fn(&GroupCtx<'_>, &Stage, usize) + Sync,
{
    let plan = launch.plan;
    let n_groups = plan.active_rings();
    if n_groups > launch.rings.len() || n_groups > launch.links.len() {
        return Err(RingError::Internal(format!(
            "plan uses {n_groups} rings, communicator has {}",
            launch.rings.len()
        )));
    }
    if plan.is_empty() {
        launch.op_counter.retire_empty(launch.op_index);
        return Ok(());
    }

    let send = RawBuf(send.as_ptr().cast_mut());
    let recv = RawBuf(recv.as_mut_ptr());
    let groups: Vec<GroupCtx<'_>> = (0..n_groups)
        .map(|g| GroupCtx {
            schedule: RingSchedule::new(plan, &launch.rings[g], g, launch.rank),
            link: launch.links[g],
            op_counter: launch.op_counter,
            n_groups,
            send,
            recv,
            count: plan.count(),
            elem: launch.dtype.size_in_bytes(),
            dtype: launch.dtype,
            op: launch.op,
            op_index: launch.op_index,
            producers: launch.producers,
            barrier: Barrier::new(launch.producers + 1),
            failed: AtomicBool::new(false),
        })
        .collect();

    tracing::debug!(
        rank = launch.rank,
        op_index = launch.op_index,
        rings = n_groups,
        chunks = plan.n_chunks(),
        chunk_size = plan.chunk_size(),
        "launching ring groups"
    );

    let panicked = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(n_groups * (launch.producers + 1));
        for ctx in &groups {
            for p in 0..launch.producers {
                handles.push(s.spawn(move || {
                    ctx.producer(p, work);
                    false
                }));
            }
            handles.push(s.spawn(move || ctx.signaler()));
        }
        let mut panicked = 0usize;
        for h in handles {
            match h.join() {
                Ok(true) => tracing::trace!(
                    rank = launch.rank,
                    op_index = launch.op_index,
                    "last ring group retired"
                ),
                Ok(false) => {}
                Err(_) => panicked += 1,
            }
        }
        panicked
    });

    let failed = groups
        .iter()
        .filter(|g| g.failed.load(Ordering::Relaxed))
        .count();
    if failed > 0 || panicked > 0 {
        tracing::error!(
            rank = launch.rank,
            op_index = launch.op_index,
            failed_groups = failed,
            panicked,
            "ring worker panicked"
        );
        return Err(RingError::device(format!(
            "ring worker panicked in op {}",
            launch.op_index
        )));
    }
    Ok(())
}

/// Reduce-scatter over a single device: the output is the input.
pub(crate) fn run_single(
    op_counter: &OpCounter,
    op_index: u64,
    send: &[u8],
    recv: &mut [u8],
) {
    recv.copy_from_slice(&send[..recv.len()]);
    op_counter.retire_empty(op_index);
}
