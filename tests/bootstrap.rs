//! Multi-rank tests of the shared-memory bootstrap on the thread fabric.

use ferrolattice::{
    CartesianCommunicator, Color, Communicator, Error, Fabric, GlobalSharedMemory, ShmBackend,
    ShmConfig, SharedMemory, WindowPtr,
};
use tempfile::TempDir;

fn config(dir: &TempDir, prefix: &str) -> ShmConfig {
    ShmConfig::default()
        .with_bytes(1 << 16)
        .with_dir(dir.path())
        .with_prefix(prefix)
}

#[test]
fn node_groups_partition_world() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "partition");
    // Node labels need not be contiguous.
    let fabric = Fabric::new(vec![0, 1, 0, 1, 2, 3, 2, 3]).unwrap();
    let topologies = fabric
        .run(|world| {
            let mut gsm = GlobalSharedMemory::new(world, cfg.clone());
            gsm.init().unwrap();
            gsm.topology().unwrap().clone()
        })
        .unwrap();

    for (rank, t) in topologies.iter().enumerate() {
        assert_eq!(t.world_rank, rank);
        assert_eq!(t.node_size, 2);
        assert_eq!(t.nodes, 4);
        assert_eq!(t.leaders, vec![0, 1, 4, 5]);
        assert_eq!(t.leaders[t.node_index], t.leader());
        assert!(t.node_members.contains(&rank));
        assert_eq!(t.node_members[t.node_rank], rank);
    }
    // Same node iff same leader, and every rank sits on exactly one node.
    for a in &topologies {
        for b in &topologies {
            let same_node = a.is_on_node(b.world_rank);
            assert_eq!(same_node, a.leader() == b.leader());
            assert_eq!(same_node, a.node_index == b.node_index);
        }
    }
    let mut covered: Vec<usize> = topologies
        .iter()
        .filter(|t| t.node_rank == 0)
        .flat_map(|t| t.node_members.clone())
        .collect();
    covered.sort_unstable();
    assert_eq!(covered, (0..8).collect::<Vec<_>>());
}

#[test]
fn uneven_topology_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "uneven");
    let fabric = Fabric::new(vec![0, 0, 0, 1]).unwrap();
    let out = fabric
        .run(|world| GlobalSharedMemory::new(world, cfg.clone()).init().err())
        .unwrap();
    for err in out {
        assert!(matches!(err, Some(Error::UnevenTopology { .. })), "{err:?}");
    }
}

#[test]
fn node_size_must_be_power_of_two() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "pow2");
    let fabric = Fabric::uniform(2, 3).unwrap();
    let out = fabric
        .run(|world| GlobalSharedMemory::new(world, cfg.clone()).init().err())
        .unwrap();
    for err in out {
        assert!(matches!(err, Some(Error::NodeSizeNotPowerOfTwo { size: 3, .. })));
    }
}

#[test]
fn lifecycle_is_checked_per_object() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "lifecycle");
    let fabric = Fabric::uniform(1, 2).unwrap();
    fabric
        .run(|world| {
            let mut gsm = GlobalSharedMemory::new(world, cfg.clone());
            assert!(matches!(gsm.allocate(4096, false), Err(Error::NotInitialized)));
            assert!(matches!(gsm.windows(), Err(Error::NotInitialized)));
            gsm.init().unwrap();
            assert!(matches!(gsm.init(), Err(Error::AlreadyInitialized)));
            assert!(matches!(gsm.windows(), Err(Error::NotAllocated)));
            assert!(matches!(gsm.allocate(0, false), Err(Error::InvalidAllocation(0))));
            gsm.allocate(4096, false).unwrap();
            assert!(matches!(gsm.allocate(4096, false), Err(Error::AlreadyAllocated)));
            assert_eq!(gsm.window_bytes().unwrap(), 4096);
        })
        .unwrap();
}

#[test]
fn self_test_passes_for_both_backends() {
    for (backend, prefix) in [
        (ShmBackend::PerRankMmap, "selftest_mmap"),
        (ShmBackend::SingleCreator, "selftest_single"),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, prefix).with_backend(backend);
        let fabric = Fabric::uniform(2, 4).unwrap();
        fabric
            .run(|world| {
                let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone()).unwrap();
                let shm = SharedMemory::bind(&gsm, gsm.world()).unwrap();
                assert_eq!(shm.node_size(), 4);
                shm.shared_memory_test().unwrap();

                // Every on-node window carries the marker written by node rank 0.
                for r in (0..shm.size()).filter(|&r| shm.is_on_node(r)) {
                    let mut words = [0u64; 3];
                    shm.read_bytes(
                        WindowPtr { rank: r, offset: 0 },
                        bytemuck::cast_slice_mut(&mut words),
                    )
                    .unwrap();
                    assert_eq!(words[0], shm.node_index() as u64);
                    assert_eq!(words[2], ferrolattice::SELF_TEST_MAGIC);
                }
            })
            .unwrap();
        // Regions are unlinked once every rank has dropped its windows.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

#[test]
fn windows_are_coherent_across_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "coherent");
    let fabric = Fabric::uniform(2, 2).unwrap();
    fabric
        .run(|world| {
            let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone()).unwrap();
            let shm = SharedMemory::bind(&gsm, gsm.world()).unwrap();
            let me = shm.rank();
            shm.write_bytes(shm.local_ptr(256), &[me as u8; 16]).unwrap();
            shm.barrier().unwrap();
            for peer in 0..shm.size() {
                match shm.buffer_for(peer) {
                    Some(_) => {
                        let mut buf = [0u8; 16];
                        shm.read_bytes(WindowPtr { rank: peer, offset: 256 }, &mut buf)
                            .unwrap();
                        assert_eq!(buf, [peer as u8; 16]);
                    }
                    None => assert_ne!(peer / 2, me / 2),
                }
            }
            shm.barrier().unwrap();
        })
        .unwrap();
}

#[test]
fn address_translation_inverse_law() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "translate");
    let fabric = Fabric::uniform(2, 4).unwrap();
    fabric
        .run(|world| {
            let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone()).unwrap();
            let shm = SharedMemory::bind(&gsm, gsm.world()).unwrap();
            let me = shm.rank();
            let mine = shm.local_ptr(1024);

            for peer in (0..shm.size()).filter(|&p| p != me) {
                match shm.translate_address(peer, mine).unwrap() {
                    Some(theirs) => {
                        assert!(shm.is_on_node(peer));
                        assert_eq!(theirs, WindowPtr { rank: peer, offset: 1024 });
                    }
                    None => assert!(!shm.is_on_node(peer)),
                }
            }

            // The peer's own pointer at the translated offset names the same
            // bytes the caller reaches through translation.
            shm.write_bytes(mine, &(me as u64).to_le_bytes()).unwrap();
            shm.barrier().unwrap();
            for peer in (0..shm.size()).filter(|&p| p != me && shm.is_on_node(p)) {
                let theirs = shm.translate_address(peer, mine).unwrap().unwrap();
                let mut buf = [0u8; 8];
                shm.read_bytes(theirs, &mut buf).unwrap();
                assert_eq!(u64::from_le_bytes(buf), peer as u64);
            }
            shm.barrier().unwrap();

            assert!(matches!(
                shm.translate_address(me, mine),
                Err(Error::SelfTranslate(_))
            ));
            let other = (me + 1) % shm.size();
            assert!(matches!(
                shm.translate_address(other, WindowPtr { rank: other, offset: 0 }),
                Err(Error::NotLocalPointer { .. })
            ));
            assert!(matches!(
                shm.translate_address(other, shm.local_ptr(1 << 16)),
                Err(Error::OutOfWindow { .. })
            ));
        })
        .unwrap();
}

#[test]
fn shared_heap_is_aligned_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "heap");
    let fabric = Fabric::uniform(1, 2).unwrap();
    fabric
        .run(|world| {
            let mut gsm = GlobalSharedMemory::new(world, cfg.clone());
            gsm.init().unwrap();
            gsm.allocate(4096, false).unwrap();
            let shm = SharedMemory::bind(&gsm, gsm.world()).unwrap();
            assert_eq!(shm.heap_size(), 4096);
            assert_eq!(shm.buffer_malloc(10).unwrap().offset, 0);
            assert_eq!(shm.buffer_malloc(100).unwrap().offset, 64);
            assert_eq!(shm.heap_used(), 192);
            assert!(matches!(
                shm.buffer_malloc(4000),
                Err(Error::ShmHeapExhausted { requested: 4000, available: 3904 })
            ));
            shm.buffer_free_all();
            assert_eq!(shm.buffer_malloc(4096).unwrap().offset, 0);
        })
        .unwrap();
}

#[test]
fn optimal_communicator_keeps_first_dimension_on_node() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "optimal");
    let processors = [2, 2, 2];
    let fabric = Fabric::uniform(2, 4).unwrap();
    let placed = fabric
        .run(|world| {
            let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone()).unwrap();
            let node = gsm.topology().unwrap().node_index;
            let comm = gsm.optimal_communicator(&processors).unwrap();
            let cart = CartesianCommunicator::new(comm, &processors).unwrap();
            (cart.rank(), cart.processor_coor().to_vec(), node)
        })
        .unwrap();

    let mut ranks: Vec<usize> = placed.iter().map(|p| p.0).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, (0..8).collect::<Vec<_>>());

    for (_, ca, na) in &placed {
        for (_, cb, nb) in &placed {
            if ca[1..] == cb[1..] {
                assert_eq!(na, nb, "{ca:?} and {cb:?} differ only in coordinate 0");
            }
        }
    }
}

#[test]
fn optimal_communicator_rejects_wrong_grid() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "wronggrid");
    let fabric = Fabric::uniform(2, 2).unwrap();
    let out = fabric
        .run(|world| {
            let mut gsm = GlobalSharedMemory::new(world, cfg.clone());
            gsm.init().unwrap();
            gsm.optimal_communicator(&[3]).err()
        })
        .unwrap();
    for err in out {
        assert!(matches!(err, Some(Error::ProcessorGridMismatch { world_size: 4, .. })));
    }
}

#[test]
fn bind_to_reordered_subcommunicator() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, "subcomm");
    let fabric = Fabric::uniform(2, 4).unwrap();
    fabric
        .run(|world| {
            let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone()).unwrap();
            let w = gsm.world().rank();
            // Odd and even world ranks, each in reverse order.
            let sub = gsm
                .world()
                .split(Color::with_value(w % 2), 100 - w)
                .unwrap()
                .unwrap();
            let shm = SharedMemory::bind(&gsm, &sub).unwrap();
            assert_eq!(shm.size(), 4);
            assert_eq!(shm.node_size(), 2);
            assert_eq!((0..shm.size()).filter(|&r| shm.is_on_node(r)).count(), 2);
            shm.shared_memory_test().unwrap();

            // Windows reached through the sub-communicator are the world
            // windows of the same processes.
            let node_windows = gsm.windows().unwrap();
            let topo = gsm.topology().unwrap();
            let mine = shm.buffer_for(shm.rank()).unwrap();
            assert_eq!(mine.path(), node_windows[topo.node_rank].path());
        })
        .unwrap();
}

#[test]
fn panicking_rank_does_not_strand_peers() {
    let fabric = Fabric::uniform(2, 2).unwrap();
    let out = fabric.run(|world| {
        if world.rank() == 1 {
            panic!("rank 1 gives up before the barrier");
        }
        world.barrier()
    });
    assert!(matches!(out, Err(Error::RankPanicked(1))), "{out:?}");
}

#[test]
fn region_failure_on_creator_reaches_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-dir");
    let cfg = ShmConfig::default()
        .with_bytes(1 << 12)
        .with_dir(&missing)
        .with_backend(ShmBackend::SingleCreator);
    let fabric = Fabric::uniform(1, 2).unwrap();
    let out = fabric
        .run(|world| GlobalSharedMemory::bootstrap(world, cfg.clone()).err())
        .unwrap();

    match &out[0] {
        Some(Error::ShmOpen { name, .. }) => assert!(name.starts_with(&missing)),
        other => panic!("creator should fail to open its region, got {other:?}"),
    }
    assert!(matches!(out[1], Some(Error::RankAborted(0))), "{:?}", out[1]);
}
