use nexar_ring::{
    Communicator, DebugLevel, DeviceAdapter, DeviceGroup, DeviceOrdinal, Fabric, HostAdapter,
    Rank, ReduceOp, Ring, RingConfig, UniqueId,
};
use std::sync::Arc;
use std::time::Duration;

/// Small staging buffers so that modest inputs already span many chunks.
pub fn test_config() -> RingConfig {
    RingConfig {
        buffer_size: 64 << 10,
        producers: 2,
        debug: DebugLevel::None,
        rendezvous_timeout: Duration::from_secs(10),
        ..RingConfig::default()
    }
}

pub fn adapter_for(fabric: &Arc<Fabric>) -> Arc<dyn DeviceAdapter> {
    Arc::new(HostAdapter::new(Arc::clone(fabric)))
}

/// A group of `n` ranks, rank `i` on device `i`, over a PCIe fabric.
pub fn pcie_group(n: usize) -> (Arc<Fabric>, DeviceGroup) {
    group_on(Arc::new(Fabric::pcie(n)), test_config())
}

pub fn group_on(fabric: Arc<Fabric>, config: RingConfig) -> (Arc<Fabric>, DeviceGroup) {
    let devices: Vec<DeviceOrdinal> = (0..fabric.device_count()).collect();
    let group = DeviceGroup::new(&devices, adapter_for(&fabric), config).unwrap();
    (fabric, group)
}

/// Input of rank `rank`: element `j` is `rank * 100 + j`.
pub fn pattern_input(rank: usize, len: usize) -> Vec<i64> {
    (0..len).map(|j| (rank * 100 + j) as i64).collect()
}

/// Expected sum output of rank `rank` for [`pattern_input`] over `n` ranks.
pub fn pattern_sum(rank: usize, n: usize, recv_count: usize) -> Vec<i64> {
    (0..recv_count)
        .map(|k| {
            let j = rank * recv_count + k;
            (0..n).map(|r| (r * 100 + j) as i64).sum()
        })
        .collect()
}

pub fn pattern_sends(n: usize, recv_count: usize) -> Vec<Vec<i64>> {
    (0..n).map(|r| pattern_input(r, recv_count * n)).collect()
}

/// Assert that `out` is the pattern sum for every rank.
pub fn assert_pattern_sum(out: &[Vec<i64>], recv_count: usize) {
    let n = out.len();
    for (rank, block) in out.iter().enumerate() {
        assert_eq!(block.len(), recv_count, "rank {rank} output length");
        let want = pattern_sum(rank, n, recv_count);
        if let Some(k) = (0..recv_count).find(|&k| block[k] != want[k]) {
            panic!(
                "rank {rank} element {k}: got {}, want {} ({n} ranks, {recv_count} per rank)",
                block[k], want[k]
            );
        }
    }
}

pub fn to_bytes_f32(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn from_bytes_f32(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// IEEE half bits of `v`. Exact for values half precision represents.
pub fn f16_bits(v: f32) -> u16 {
    if v == 0.0 {
        return 0;
    }
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mant = ((bits >> 13) & 0x3ff) as u16;
    sign | ((exp as u16) << 10) | mant
}

pub fn f16_value(h: u16) -> f32 {
    if h & 0x7fff == 0 {
        return 0.0;
    }
    let sign = if h & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((h >> 10) & 0x1f) as i32 - 15;
    let mant = (h & 0x3ff) as f32 / 1024.0;
    sign * (1.0 + mant) * 2f32.powi(exp)
}

/// bfloat16 bits of `v`, truncating. Exact for small integers.
pub fn bf16_bits(v: f32) -> u16 {
    (v.to_bits() >> 16) as u16
}

pub fn bf16_value(h: u16) -> f32 {
    f32::from_bits((h as u32) << 16)
}

pub fn halves_to_bytes(v: &[u16]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn bytes_to_halves(b: &[u8]) -> Vec<u16> {
    b.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Build one communicator per rank, each through its own adapter, the way
/// separate processes would.
pub fn init_ranks<F>(n: usize, config: RingConfig, adapter: F) -> nexar_ring::Result<Vec<Communicator>>
where
    F: Fn(usize) -> Arc<dyn DeviceAdapter> + Sync,
{
    let id = UniqueId::new();
    let results: Vec<nexar_ring::Result<Communicator>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|rank| {
                let adapter = adapter(rank);
                let config = config.clone();
                s.spawn(move || {
                    Communicator::init_rank(n, id, rank as Rank, rank, adapter, config)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    results.into_iter().collect()
}

/// Pattern sum over communicators driven one thread each.
pub fn run_pattern_sum(comms: &[Communicator], recv_count: usize) -> Vec<Vec<i64>> {
    let n = comms.len();
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .enumerate()
            .map(|(rank, comm)| {
                s.spawn(move || {
                    let send = pattern_input(rank, recv_count * n);
                    let mut recv = vec![0i64; recv_count];
                    comm.reduce_scatter_typed(&send, &mut recv, ReduceOp::Sum)
                        .unwrap();
                    recv
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Sum of block `block` combined the way the ring carries it: starting at
/// the block owner's successor, `acc + local` at every hop, ending at the
/// owner.
pub fn ring_order_sum(ring: &Ring, block: Rank, value: impl Fn(Rank) -> f32) -> f32 {
    let n = ring.len();
    let owner = ring.position_of(block);
    let mut acc = value(ring.user_at((owner + 1) % n));
    for hop in 2..=n {
        acc += value(ring.user_at((owner + hop) % n));
    }
    acc
}
