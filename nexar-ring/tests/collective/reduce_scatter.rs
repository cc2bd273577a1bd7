use nexar_ring::{DataType, DeviceGroup, ErrorKind, Fabric, ReduceOp, RingError, TopologyId};
use std::sync::Arc;

use super::helpers::*;

fn sum_over(n: usize, recv_count: usize) {
    let (fabric, group) = pcie_group(n);
    let sends = pattern_sends(n, recv_count);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, recv_count);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_sum_2_ranks_small() {
    sum_over(2, 64);
}

#[test]
fn test_sum_3_ranks_small() {
    sum_over(3, 100);
}

#[test]
fn test_sum_4_ranks_multi_chunk() {
    // 1360 i64 elements fit one chunk of a 64 KiB buffer on 4 ranks.
    sum_over(4, 5000);
}

#[test]
fn test_sum_8_ranks_multi_chunk() {
    sum_over(8, 2000);
}

#[test]
fn test_count_not_a_multiple_of_chunk() {
    sum_over(3, 4099);
}

#[test]
fn test_count_below_alignment() {
    sum_over(4, 3);
}

#[test]
fn test_single_element_per_rank() {
    sum_over(2, 1);
}

#[test]
fn test_zero_count_completes() {
    let (_fabric, group) = pcie_group(3);
    let sends: Vec<Vec<i64>> = vec![Vec::new(); 3];
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert!(out.iter().all(|o| o.is_empty()));
    assert!(group.comms().iter().all(|c| c.completed_ops() == 1));

    // The ring is still usable afterwards.
    let sends = pattern_sends(3, 40);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 40);
}

#[test]
fn test_single_device_copies_input() {
    let (fabric, group) = group_on(Arc::new(Fabric::pcie(1)), test_config());
    let input: Vec<f64> = (0..257).map(|i| i as f64 * 0.5).collect();
    let out = group
        .reduce_scatter_typed(&[input.clone()], ReduceOp::Prod)
        .unwrap();
    assert_eq!(out, vec![input]);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_duplicate_devices() {
    let fabric = Arc::new(Fabric::pcie(2));
    let group = DeviceGroup::new(&[0, 0, 1], adapter_for(&fabric), test_config()).unwrap();
    let sends = pattern_sends(3, 700);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 700);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_integer_types() {
    let (_fabric, group) = pcie_group(3);
    let n = 3;
    let recv_count = 50;

    let sends: Vec<Vec<i8>> = (0..n)
        .map(|r| (0..recv_count * n).map(|j| (j % 20) as i8 - r as i8).collect())
        .collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, &v) in block.iter().enumerate() {
            let j = rank * recv_count + k;
            let want: i8 = (0..n).map(|r| (j % 20) as i8 - r as i8).sum();
            assert_eq!(v, want);
        }
    }

    let sends: Vec<Vec<u32>> = (0..n)
        .map(|r| (0..recv_count * n).map(|j| (j * 7 + r) as u32).collect())
        .collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Max).unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, &v) in block.iter().enumerate() {
            let j = rank * recv_count + k;
            assert_eq!(v, (j * 7 + n - 1) as u32);
        }
    }

    let sends: Vec<Vec<u64>> = (0..n)
        .map(|r| (0..recv_count * n).map(|j| (j + r * 1000) as u64).collect())
        .collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Min).unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, &v) in block.iter().enumerate() {
            assert_eq!(v, (rank * recv_count + k) as u64);
        }
    }

    let sends: Vec<Vec<i32>> = (0..n)
        .map(|r| (0..recv_count * n).map(|j| if j % 2 == 0 { r as i32 + 1 } else { -1 }).collect())
        .collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Prod).unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, &v) in block.iter().enumerate() {
            let j = rank * recv_count + k;
            assert_eq!(v, if j % 2 == 0 { 6 } else { -1 });
        }
    }
}

#[test]
fn test_u8_wraps() {
    let (_fabric, group) = pcie_group(2);
    let sends = [vec![200u8; 8], vec![100u8; 8]];
    let refs: Vec<&[u8]> = sends.iter().map(|s| s.as_slice()).collect();
    let out = group
        .reduce_scatter(&refs, 4, DataType::U8, ReduceOp::Sum)
        .unwrap();
    assert_eq!(out, vec![vec![44u8; 4], vec![44u8; 4]]);
}

#[test]
fn test_float_min_max() {
    let (_fabric, group) = pcie_group(4);
    let n = 4;
    let recv_count = 300;
    let sends: Vec<Vec<f32>> = (0..n)
        .map(|r| {
            (0..recv_count * n)
                .map(|j| ((j * 31 + r * 17) % 97) as f32 - 40.5)
                .collect()
        })
        .collect();

    let max = group.reduce_scatter_typed(&sends, ReduceOp::Max).unwrap();
    let min = group.reduce_scatter_typed(&sends, ReduceOp::Min).unwrap();
    for rank in 0..n {
        for k in 0..recv_count {
            let j = rank * recv_count + k;
            let col: Vec<f32> = sends.iter().map(|s| s[j]).collect();
            assert_eq!(max[rank][k], col.iter().cloned().fold(f32::MIN, f32::max));
            assert_eq!(min[rank][k], col.iter().cloned().fold(f32::MAX, f32::min));
        }
    }
}

#[test]
fn test_f32_bytes_sum() {
    let (_fabric, group) = pcie_group(2);
    let a = to_bytes_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = to_bytes_f32(&[0.5, 0.5, 0.5, 0.5, 0.5, 0.5]);
    let out = group
        .reduce_scatter(&[&a, &b], 3, DataType::F32, ReduceOp::Sum)
        .unwrap();
    assert_eq!(from_bytes_f32(&out[0]), vec![1.5, 2.5, 3.5]);
    assert_eq!(from_bytes_f32(&out[1]), vec![4.5, 5.5, 6.5]);
}

#[test]
fn test_f16_sum() {
    let (_fabric, group) = pcie_group(3);
    let recv_count = 40;
    let sends: Vec<Vec<u8>> = (0..3)
        .map(|r| {
            let vals: Vec<u16> = (0..recv_count * 3)
                .map(|j| f16_bits(((j % 16) + r) as f32 * 0.5))
                .collect();
            halves_to_bytes(&vals)
        })
        .collect();
    let refs: Vec<&[u8]> = sends.iter().map(|s| s.as_slice()).collect();
    let out = group
        .reduce_scatter(&refs, recv_count, DataType::F16, ReduceOp::Sum)
        .unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, h) in bytes_to_halves(block).into_iter().enumerate() {
            let j = rank * recv_count + k;
            let want: f32 = (0..3).map(|r| ((j % 16) + r) as f32 * 0.5).sum();
            assert_eq!(f16_value(h), want, "rank {rank} element {k}");
        }
    }
}

#[test]
fn test_bf16_max() {
    let (_fabric, group) = pcie_group(2);
    let recv_count = 33;
    let sends: Vec<Vec<u8>> = (0..2)
        .map(|r| {
            let vals: Vec<u16> = (0..recv_count * 2)
                .map(|j| bf16_bits(if (j + r) % 2 == 0 { j as f32 } else { -(j as f32) }))
                .collect();
            halves_to_bytes(&vals)
        })
        .collect();
    let refs: Vec<&[u8]> = sends.iter().map(|s| s.as_slice()).collect();
    let out = group
        .reduce_scatter(&refs, recv_count, DataType::BF16, ReduceOp::Max)
        .unwrap();
    for (rank, block) in out.iter().enumerate() {
        for (k, h) in bytes_to_halves(block).into_iter().enumerate() {
            let j = rank * recv_count + k;
            assert_eq!(bf16_value(h), j as f32);
        }
    }
}

#[test]
fn test_f64_and_i64_prod() {
    let (_fabric, group) = pcie_group(3);
    let sends: Vec<Vec<f64>> = (0..3).map(|r| vec![(r + 1) as f64; 30]).collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Prod).unwrap();
    assert!(out.iter().all(|o| o == &vec![6.0f64; 10]));

    let sends: Vec<Vec<i64>> = (0..3).map(|r| vec![-(r as i64) - 2; 30]).collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Prod).unwrap();
    assert!(out.iter().all(|o| o == &vec![-24i64; 10]));
}

#[test]
fn test_bad_send_length_rejected() {
    let (_fabric, group) = pcie_group(2);
    let a = vec![0u8; 32];
    let b = vec![0u8; 32];
    let err = group
        .reduce_scatter(&[&a, &b], 3, DataType::F32, ReduceOp::Sum)
        .unwrap_err();
    assert!(matches!(
        err,
        RingError::BufferSizeMismatch {
            buffer: "send",
            expected: 24,
            actual: 32
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_bad_recv_length_rejected_by_communicator() {
    let (_fabric, group) = pcie_group(2);
    let comm = group.comm(0).unwrap();
    let send = vec![0u8; 16];
    let mut recv = vec![0u8; 4];
    let err = comm
        .reduce_scatter(&send, &mut recv, 2, DataType::F32, ReduceOp::Sum)
        .unwrap_err();
    assert!(matches!(
        err,
        RingError::BufferSizeMismatch { buffer: "recv", .. }
    ));
    // A rejected call does not consume a slot in the collective sequence.
    let sends = pattern_sends(2, 10);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 10);
}

#[test]
fn test_f16_sum_ties_to_even() {
    let (_fabric, group) = pcie_group(2);
    // 2048 + 1 is a tie between 2048 and 2050 in half precision.
    let a = halves_to_bytes(&[0x6800; 8]);
    let b = halves_to_bytes(&[0x3C00; 8]);
    let out = group
        .reduce_scatter(&[a.as_slice(), b.as_slice()], 4, DataType::F16, ReduceOp::Sum)
        .unwrap();
    for block in &out {
        assert_eq!(bytes_to_halves(block), vec![0x6800u16; 4]);
    }
}

/// Per-rank values whose float sum depends on the order of combination.
fn order_sensitive(rank: u32, j: usize) -> f32 {
    match (rank as usize + j) % 4 {
        0 => -1.0e8,
        1 => 1.0e8,
        2 => 1.0,
        _ => 3.0,
    }
}

fn assert_ring_order(group: &DeviceGroup, recv_count: usize) {
    let n = group.len();
    let sends: Vec<Vec<f32>> = (0..n as u32)
        .map(|r| (0..recv_count * n).map(|j| order_sensitive(r, j)).collect())
        .collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    let ring = &group.comm(0).unwrap().rings()[0];
    for (rank, block) in out.iter().enumerate() {
        for (k, v) in block.iter().enumerate() {
            let j = rank * recv_count + k;
            let want = ring_order_sum(ring, rank as u32, |r| order_sensitive(r, j));
            assert_eq!(v.to_bits(), want.to_bits(), "rank {rank} element {k}");
        }
    }
    // The same inputs give the same bits every time.
    let again = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_eq!(again, out);
}

#[test]
fn test_float_sum_follows_ring_order() {
    let (_fabric, group) = pcie_group(3);
    // Block 0 holds -1e8 on rank 0, 1e8 on rank 1, 1 on rank 2. The ring
    // computes (1e8 + 1) + -1e8, which is 0 in f32; rank order would give 1.
    let sends: Vec<Vec<f32>> = vec![
        vec![-1.0e8, 0.0, 0.0],
        vec![1.0e8, 0.0, 0.0],
        vec![1.0, 0.0, 0.0],
    ];
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_eq!(out[0][0].to_bits(), ((1.0e8f32 + 1.0) + -1.0e8).to_bits());
    assert_eq!(out[0][0], 0.0);

    assert_ring_order(&group, 5);
}

#[test]
fn test_float_sum_follows_permuted_ring() {
    // Ranks sit on devices in reverse, so the table ring visits them as
    // 3, 2, 1, 0.
    let fabric = Arc::new(Fabric::with_topology(TopologyId::HalfCubeMesh, 4));
    let group = DeviceGroup::new(&[3, 2, 1, 0], adapter_for(&fabric), test_config()).unwrap();
    let ring = &group.comm(0).unwrap().rings()[0];
    assert_eq!(ring.user_from_ring(), &[3, 2, 1, 0]);
    // Few enough elements that only the first ring carries data.
    assert_ring_order(&group, 3);
}

#[test]
fn test_every_dtype_and_op_accepted() {
    let (_fabric, group) = pcie_group(2);
    let dtypes = [
        DataType::I8,
        DataType::U8,
        DataType::I32,
        DataType::U32,
        DataType::F16,
        DataType::BF16,
        DataType::F32,
        DataType::F64,
        DataType::I64,
        DataType::U64,
    ];
    let ops = [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Min, ReduceOp::Max];
    for dtype in dtypes {
        let send = vec![0u8; 2 * 8 * dtype.size_in_bytes()];
        for op in ops {
            let out = group
                .reduce_scatter(&[send.as_slice(), send.as_slice()], 8, dtype, op)
                .unwrap_or_else(|e| panic!("{dtype} {op}: {e}"));
            assert!(out.iter().all(|o| o.iter().all(|&b| b == 0)), "{dtype} {op}");
        }
    }
}
