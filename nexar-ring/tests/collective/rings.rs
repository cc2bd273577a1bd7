use nexar_ring::{
    DeviceAdapter, Fabric, HandleKind, HostAdapter, ReduceOp, TopologyId, TransportClass,
};
use std::sync::Arc;

use super::helpers::*;

#[test]
fn test_cube_mesh_uses_four_rings() {
    let fabric = Arc::new(Fabric::with_topology(TopologyId::CubeMesh, 8));
    let (fabric, group) = group_on(fabric, test_config());
    for comm in group.comms() {
        assert_eq!(comm.topology(), TopologyId::CubeMesh);
        assert_eq!(comm.n_rings(), 4);
        assert!(
            comm.transport_classes()
                .iter()
                .all(|&c| c == TransportClass::PeerMapped)
        );
    }
    // Large enough that every ring gets chunks.
    let sends = pattern_sends(8, 5000);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 5000);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_every_ring_is_a_permutation() {
    let fabric = Arc::new(Fabric::with_topology(TopologyId::BigBasin, 8));
    let (_fabric, group) = group_on(fabric, test_config());
    let comm = group.comm(0).unwrap();
    assert_eq!(comm.topology(), TopologyId::BigBasin);
    for ring in comm.rings() {
        let mut members = ring.user_from_ring().to_vec();
        members.sort_unstable();
        assert_eq!(members, (0..8).collect::<Vec<_>>());
    }
    // Every rank agrees on the rings.
    for other in group.comms() {
        assert_eq!(other.rings(), comm.rings());
    }
}

#[test]
fn test_small_collective_stays_on_first_ring() {
    let fabric = Arc::new(Fabric::with_topology(TopologyId::HalfCubeMesh, 4));
    let (_fabric, group) = group_on(fabric, test_config());
    let comm = group.comm(0).unwrap();
    assert!(comm.n_rings() > 1);

    // 10 elements per rank fit a single chunk, so only ring 0 is active.
    let sends: Vec<Vec<i64>> = (0..4).map(|r| vec![r as i64 + 1; 40]).collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert!(out.iter().all(|o| o == &vec![10i64; 10]));

    for comm in group.comms() {
        let first = comm.own_region(0).unwrap();
        assert!(first.staging_snapshot().iter().any(|&b| b != 0));
        for ring in 1..comm.n_rings() {
            let region = comm.own_region(ring).unwrap();
            assert!(
                region.staging_snapshot().iter().all(|&b| b == 0),
                "rank {} ring {ring} staging was touched",
                comm.rank()
            );
            assert_eq!(region.ready().load(), 0);
        }
    }
}

#[test]
fn test_idle_rings_untouched_with_two_active() {
    let fabric = Arc::new(Fabric::with_topology(TopologyId::HalfCubeMesh, 4));
    let (_fabric, group) = group_on(fabric, test_config());
    assert_eq!(group.comm(0).unwrap().n_rings(), 4);

    // 20 elements per block is two 16-element chunks: rings 0 and 1 carry
    // one each, rings 2 and 3 sit idle.
    let sends: Vec<Vec<i64>> = (0..4).map(|r| vec![r as i64 + 1; 80]).collect();
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert!(out.iter().all(|o| o == &vec![10i64; 20]));

    for comm in group.comms() {
        for ring in 0..comm.n_rings() {
            let region = comm.own_region(ring).unwrap();
            let touched = region.staging_snapshot().iter().any(|&b| b != 0);
            assert_eq!(touched, ring < 2, "rank {} ring {ring}", comm.rank());
            assert_eq!(region.ready().load(), 0, "rank {} ring {ring}", comm.rank());
            assert_eq!(region.done().load(), 0, "rank {} ring {ring}", comm.rank());
        }
    }

    // A follow-up on every ring still starts from clean flags.
    let sends = pattern_sends(4, 5000);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 5000);
    for comm in group.comms() {
        for ring in 0..comm.n_rings() {
            let region = comm.own_region(ring).unwrap();
            assert_eq!(region.ready().load(), 0);
            assert_eq!(region.done().load(), 0);
        }
    }
}

#[test]
fn test_ranks_in_separate_processes_use_ipc() {
    let fabric = Arc::new(Fabric::pcie(3));
    let comms = init_ranks(3, test_config(), |rank| {
        Arc::new(HostAdapter::new(Arc::clone(&fabric)).with_process(1000 + rank as u32))
            as Arc<dyn DeviceAdapter>
    })
    .unwrap();
    for comm in &comms {
        assert_eq!(comm.transport_classes(), vec![TransportClass::Ipc]);
        assert_eq!(comm.successor_handles(), vec![HandleKind::IpcOpened]);
    }
    assert_eq!(fabric.live().exports, 3);
    assert_eq!(fabric.live().ipc_opened, 3);

    let out = run_pattern_sum(&comms, 1500);
    assert_pattern_sum(&out, 1500);

    for comm in comms {
        comm.destroy().unwrap();
    }
    assert!(fabric.live().is_clear());
}

#[test]
fn test_no_peer_access_goes_through_host() {
    let fabric = Arc::new(Fabric::builder(3).build());
    let (fabric, group) = group_on(fabric, test_config());
    for comm in group.comms() {
        assert_eq!(comm.transport_classes(), vec![TransportClass::SharedHost]);
        assert_eq!(comm.successor_handles(), vec![HandleKind::SharedHost]);
    }
    assert_eq!(fabric.live().host_mappings, 3);

    let sends = pattern_sends(3, 2500);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 2500);
    group.destroy().unwrap();
    assert!(fabric.live().is_clear());
}

#[test]
fn test_partial_peer_access_mixes_classes() {
    // Ring 0 -> 1 -> 2 -> 0; only 0 and 1 can reach each other directly.
    let fabric = Arc::new(Fabric::builder(3).peer_access(0, 1).build());
    let (_fabric, group) = group_on(fabric, test_config());
    let classes: Vec<TransportClass> = group
        .comms()
        .iter()
        .map(|c| c.transport_classes()[0])
        .collect();
    assert_eq!(
        classes,
        vec![
            TransportClass::PeerMapped,
            TransportClass::SharedHost,
            TransportClass::SharedHost
        ]
    );
    let sends = pattern_sends(3, 600);
    let out = group.reduce_scatter_typed(&sends, ReduceOp::Sum).unwrap();
    assert_pattern_sum(&out, 600);
}

#[test]
fn test_ranks_on_different_hosts() {
    let fabric = Arc::new(Fabric::with_topology(TopologyId::HalfCubeMesh, 4));
    let comms = init_ranks(4, test_config(), |rank| {
        Arc::new(HostAdapter::new(Arc::clone(&fabric)).with_host(format!("node{rank}")))
            as Arc<dyn DeviceAdapter>
    })
    .unwrap();
    for comm in &comms {
        assert_eq!(comm.topology(), TopologyId::Pcie);
        assert_eq!(comm.transport_classes(), vec![TransportClass::SharedHost]);
    }
    let out = run_pattern_sum(&comms, 800);
    assert_pattern_sum(&out, 800);
    drop(comms);
    assert!(fabric.live().is_clear());
}
