//! Shared-memory bootstrap example - node discovery, windows and self test.
//!
//! Simulates two nodes of four ranks each on the thread fabric, resolves the
//! node topology, maps the node windows, runs the coherence self test and
//! prints the node-aware rank layout for a 2 x 2 x 2 processor grid.
//!
//! Run with: `RUST_LOG=debug cargo run --example shared_memory`

use ferrolattice::{
    CartesianCommunicator, Communicator, Fabric, GlobalSharedMemory, Result, ShmConfig,
    SharedMemory,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .init();

    // FERROLATTICE_SHM_* variables override the small demo window.
    let config = ShmConfig::default().with_bytes(1 << 20).with_env()?;
    let processors = [2, 2, 2];

    let fabric = Fabric::uniform(2, 4)?;
    let lines = fabric.run(|world| -> Result<String> {
        let gsm = GlobalSharedMemory::bootstrap(world, config.clone())?;
        let topo = gsm.topology()?.clone();

        let shm = SharedMemory::bind(&gsm, gsm.world())?;
        shm.shared_memory_test()?;

        let comm = gsm.optimal_communicator(&processors)?;
        let cart = CartesianCommunicator::new(comm, &processors)?;
        let (down, up) = cart.shifted_ranks(0, 1);
        cart.comm().barrier()?;

        Ok(format!(
            "world rank {} | node {} (leader {}) rank {}/{} | grid rank {} at {:?} | dim 0 neighbours {} / {}",
            topo.world_rank,
            topo.node_index,
            topo.leader(),
            topo.node_rank,
            topo.node_size,
            cart.rank(),
            cart.processor_coor(),
            down,
            up,
        ))
    })?;

    for line in lines {
        println!("{}", line?);
    }
    println!("\nShared memory self test passed on every node!");
    Ok(())
}
