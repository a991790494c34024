//! # ferrolattice
//!
//! Distributed data movement for SIMD-vectorized Cartesian lattices.
//!
//! The crate covers two coupled pieces:
//!
//! - **Shared-memory bootstrap**: discover which ranks share a node, elect
//!   node leaders, renumber ranks so that Cartesian neighbours land on the
//!   same node, and map one shared window per rank into every rank of the
//!   node ([`GlobalSharedMemory`], [`SharedMemory`]).
//! - **Cartesian shift**: move a lattice by a fixed offset along one
//!   dimension ([`cshift`]), copying planes locally where possible, permuting
//!   SIMD lanes when the shift wraps across lanes, and exchanging halo planes
//!   with neighbouring processes otherwise. Red-black (checkerboarded)
//!   lattices are supported.
//!
//! All communication goes through the [`Communicator`] trait. The crate ships
//! [`Fabric`], an in-process transport where every rank is a thread; shared
//! windows are real memory-mapped files either way.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use ferrolattice::{
//!     cshift, CartesianCommunicator, Fabric, GlobalSharedMemory, Lattice, Parity, ShmConfig,
//! };
//!
//! fn main() -> Result<(), ferrolattice::Error> {
//!     let dir = tempfile::tempdir().unwrap();
//!     let config = ShmConfig::default()
//!         .with_bytes(1 << 16)
//!         .with_dir(dir.path())
//!         .with_prefix("quick_start");
//!
//!     // Two nodes of two ranks each.
//!     let fabric = Fabric::uniform(2, 2)?;
//!     fabric.run(|world| -> Result<(), ferrolattice::Error> {
//!         let gsm = GlobalSharedMemory::bootstrap(world, config.clone())?;
//!         let comm = gsm.optimal_communicator(&[4])?;
//!         let cart = CartesianCommunicator::new(comm, &[4])?.with_shared_memory(&gsm)?;
//!
//!         let grid = Arc::new(cart.full_grid(&[16], &[1])?);
//!         let field: Lattice<f64> = Lattice::from_fn(grid.clone(), Parity::Even, |x| x[0] as f64)?;
//!         let mut shifted = Lattice::new(grid)?;
//!         cshift(&mut shifted, &field, &cart, 0, 5)?;
//!         shifted.for_each_site(|x, v| assert_eq!(v, ((x[0] + 5) % 16) as f64));
//!         Ok(())
//!     })?
//!     .into_iter()
//!     .collect()
//! }
//! ```
//!
//! ## Configuration
//!
//! [`ShmConfig::from_env`] reads the `FERROLATTICE_*` environment variables;
//! see the [`ShmConfig`] documentation for the list.
//!
//! ## Logging
//!
//! Diagnostics are emitted through [`tracing`]; install a subscriber in the
//! host application to see them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
// Index arithmetic over lattice extents is done in usize throughout
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_arguments)]

mod cartesian;
mod comm;
mod config;
mod cshift;
mod error;
mod fabric;
mod grid;
mod lattice;
pub mod plane;
mod shared;
mod simd;
pub mod topology;
mod window;

pub use cartesian::CartesianCommunicator;
pub use comm::{Color, Communicator};
pub use config::{ShmBackend, ShmConfig, DEFAULT_SHM_BYTES, MAX_LOG2_RANKS_PER_NODE};
pub use cshift::{cshift, cshift_local};
pub use error::{Error, Result};
pub use fabric::{Fabric, ThreadComm};
pub use grid::{CbMask, CheckerLayout, GridLayout, Parity};
pub use lattice::Lattice;
pub use shared::{SharedMemory, WindowPtr, SELF_TEST_MAGIC};
pub use simd::{Lanes, LanePattern, PatternKind, PermuteType, SiteObject};
pub use topology::NodeTopology;
pub use window::{GlobalSharedMemory, ShmRegion, WINDOW_ALIGN};
