//! Halo shift example - Cartesian shift of a distributed, vectorized lattice.
//!
//! A 16 x 8 lattice of two-lane site vectors is spread over a 2 x 2
//! processor grid (two simulated nodes). Each rank fills its sites with a
//! function of the global coordinate, shifts along both dimensions, and
//! checks the result against the same function evaluated at the shifted
//! coordinate. A red-black copy of the lattice is shifted too.
//!
//! Run with: `cargo run --example halo_shift`

use std::sync::Arc;

use ferrolattice::{
    cshift, CartesianCommunicator, CheckerLayout, Fabric, GlobalSharedMemory, Lanes,
    Lattice, Parity, Result, ShmConfig,
};
use tracing_subscriber::EnvFilter;

const FDIMS: [usize; 2] = [16, 8];
const SIMD: [usize; 2] = [2, 1];
const PROCESSORS: [usize; 2] = [2, 2];

fn field(x: &[usize]) -> f64 {
    x[0] as f64 + 100.0 * x[1] as f64
}

/// Number of sites of `out` that do not hold `field(x + shift * e_dim)`.
fn errors(out: &Lattice<Lanes<f64, 2>>, dim: usize, shift: isize) -> usize {
    let mut bad = 0;
    out.for_each_site(|x, v| {
        let mut y = x.to_vec();
        y[dim] = (x[dim] as isize + shift).rem_euclid(FDIMS[dim] as isize) as usize;
        if v != field(&y) {
            bad += 1;
        }
    });
    bad
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = ShmConfig::default().with_bytes(1 << 20).with_env()?;
    let fabric = Fabric::uniform(2, 2)?;

    let reports = fabric.run(|world| -> Result<(usize, usize, usize)> {
        let gsm = GlobalSharedMemory::bootstrap(world, config.clone())?;
        let comm = gsm.optimal_communicator(&PROCESSORS)?;
        let cart = CartesianCommunicator::new(comm, &PROCESSORS)?.with_shared_memory(&gsm)?;

        let full = Arc::new(cart.full_grid(&FDIMS, &SIMD)?);
        let lat: Lattice<Lanes<f64, 2>> =
            Lattice::from_fn(Arc::clone(&full), Parity::Even, field)?;
        let mut out = Lattice::new(Arc::clone(&full))?;

        let mut checked = 0;
        let mut bad = 0;
        for dim in 0..2 {
            for shift in [1, -1, 3, 9] {
                cshift(&mut out, &lat, &cart, dim, shift)?;
                bad += errors(&out, dim, shift);
                checked += 1;
            }
        }

        let red_black = Arc::new(full.to_red_black(CheckerLayout::new(0, 2))?);
        let odd: Lattice<Lanes<f64, 2>> =
            Lattice::from_fn(Arc::clone(&red_black), Parity::Odd, field)?;
        let mut shifted = Lattice::new(Arc::clone(&red_black))?;
        for shift in [1, 2, -3] {
            cshift(&mut shifted, &odd, &cart, 0, shift)?;
            bad += errors(&shifted, 0, shift);
            checked += 1;
        }

        Ok((cart.rank(), checked, bad))
    })?;

    let mut failures = 0;
    for report in reports {
        let (rank, checked, bad) = report?;
        println!("Rank {rank}: {checked} shifts checked, {bad} wrong sites");
        failures += bad;
    }
    assert_eq!(failures, 0, "shifted lattice does not match!");
    println!("\nHalo shift test passed!");
    Ok(())
}
