use nexar_ring::{DataType, Fabric, ReduceOp, RingConfig};
use std::sync::Arc;

use super::helpers::*;

#[test]
fn test_repeated_collectives_identical() {
    let (_fabric, group) = pcie_group(4);
    let sends = pattern_sends(4, 3000);
    let first = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&first, 3000);
    for _ in 0..5 {
        let again = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
        assert_eq!(again, first);
    }
    assert!(group.comms().iter().all(|c| c.completed_ops() == 6));
}

#[test]
fn test_varying_sizes_back_to_back() {
    let (_fabric, group) = pcie_group(3);
    for (i, recv_count) in [1usize, 17, 0, 2048, 5, 9000, 64].into_iter().enumerate() {
        let sends = pattern_sends(3, recv_count);
        let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
        assert_pattern_sum(&out, recv_count);
        assert!(group.comms().iter().all(|c| c.completed_ops() == i as u64 + 1));
    }
}

#[test]
fn test_mixed_dtypes_and_ops() {
    let (_fabric, group) = pcie_group(2);
    let floats = vec![vec![1.5f32; 100], vec![2.0f32; 100]];
    let ints = vec![vec![3u64; 64], vec![5u64; 64]];
    for _ in 0..3 {
        let out = group.reduce_scatter_typed(&floats, ReduceOp::Prod).unwrap();
        assert!(out.iter().all(|o| o == &vec![3.0f32; 50]));
        let out = group.reduce_scatter_typed(&ints, ReduceOp::Min).unwrap();
        assert!(out.iter().all(|o| o == &vec![3u64; 32]));
    }
}

#[test]
fn test_checksums_do_not_change_results() {
    let config = RingConfig {
        print_checksums: true,
        ..test_config()
    };
    let (_fabric, group) = group_on(Arc::new(Fabric::pcie(2)), config);
    let a = to_bytes_f32(&[1.0; 8]);
    let b = to_bytes_f32(&[2.0; 8]);
    let out = group
        .reduce_scatter(&[&a, &b], 4, DataType::F32, ReduceOp::Sum)
        .unwrap();
    assert_eq!(from_bytes_f32(&out[0]), vec![3.0; 4]);
    assert_eq!(from_bytes_f32(&out[1]), vec![3.0; 4]);
}

#[test]
fn test_more_producers_than_default() {
    let config = RingConfig {
        producers: 5,
        ..test_config()
    };
    let (fabric, group) = group_on(Arc::new(Fabric::pcie(3)), config);
    let sends = pattern_sends(3, 1234);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 1234);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_single_producer() {
    let config = RingConfig {
        producers: 1,
        ..test_config()
    };
    let (_fabric, group) = group_on(Arc::new(Fabric::pcie(4)), config);
    let sends = pattern_sends(4, 777);
    for _ in 0..2 {
        let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
        assert_pattern_sum(&out, 777);
    }
}
