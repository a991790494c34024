//! Cartesian processor grid over a communicator.
//!
//! Ranks are placed on the processor grid in reversed lexicographic order
//! (last dimension fastest), which matches the numbering produced by
//! [`GlobalSharedMemory::optimal_communicator`].

use bytemuck::Pod;
use tracing::{trace, warn};

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::grid::GridLayout;
use crate::shared::SharedMemory;
use crate::topology::{coor_from_index_reversed, index_from_coor_reversed};
use crate::window::GlobalSharedMemory;

/// A communicator arranged as a periodic Cartesian processor grid.
pub struct CartesianCommunicator<C: Communicator> {
    comm: C,
    processors: Vec<usize>,
    processor_coor: Vec<usize>,
    shm: Option<SharedMemory<C>>,
}

impl<C: Communicator> CartesianCommunicator<C> {
    /// Arrange `comm` as the processor grid `processors`.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessorGridMismatch`] if the grid does not cover `comm`.
    pub fn new(comm: C, processors: &[usize]) -> Result<Self> {
        let n: usize = processors.iter().product();
        if processors.is_empty() || n != comm.size() {
            return Err(Error::ProcessorGridMismatch {
                processors: processors.to_vec(),
                world_size: comm.size(),
            });
        }
        let processor_coor = coor_from_index_reversed(comm.rank(), processors);
        Ok(CartesianCommunicator {
            comm,
            processors: processors.to_vec(),
            processor_coor,
            shm: None,
        })
    }

    /// Bind the node windows of `global` so that on-node exchanges go
    /// through shared memory.
    ///
    /// Collective over the communicator.
    pub fn with_shared_memory(mut self, global: &GlobalSharedMemory<C>) -> Result<Self> {
        self.shm = Some(SharedMemory::bind(global, &self.comm)?);
        Ok(self)
    }

    /// The underlying communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Rank of the caller.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// Processor grid.
    pub fn processors(&self) -> &[usize] {
        &self.processors
    }

    /// Caller's coordinate in the processor grid.
    pub fn processor_coor(&self) -> &[usize] {
        &self.processor_coor
    }

    /// Bound node shared memory, if any.
    pub fn shared_memory(&self) -> Option<&SharedMemory<C>> {
        self.shm.as_ref()
    }

    /// Rank at processor coordinate `coor`.
    pub fn rank_from_coor(&self, coor: &[usize]) -> usize {
        index_from_coor_reversed(coor, &self.processors)
    }

    /// Processor coordinate of `rank`.
    pub fn coor_from_rank(&self, rank: usize) -> Vec<usize> {
        coor_from_index_reversed(rank, &self.processors)
    }

    /// Ranks `shift` processors away along `dim`, periodically:
    /// `(xmit_to, recv_from)` = (coordinate - shift, coordinate + shift).
    pub fn shifted_ranks(&self, dim: usize, shift: usize) -> (usize, usize) {
        let extent = self.processors[dim];
        let shift = shift % extent;
        let mut coor = self.processor_coor.clone();
        coor[dim] = (self.processor_coor[dim] + shift) % extent;
        let recv_from = self.rank_from_coor(&coor);
        coor[dim] = (self.processor_coor[dim] + extent - shift) % extent;
        let xmit_to = self.rank_from_coor(&coor);
        (xmit_to, recv_from)
    }

    /// Layout of a lattice of extent `fdimensions` over this processor grid.
    pub fn full_grid(&self, fdimensions: &[usize], simd_layout: &[usize]) -> Result<GridLayout> {
        GridLayout::full(
            fdimensions,
            simd_layout,
            &self.processors,
            &self.processor_coor,
        )
    }

    /// Send `send` to `dest` and receive `recv` from `source`.
    ///
    /// With bound shared memory, on-node peers exchange through staging
    /// buffers in the node windows; this must then be entered by every
    /// on-node rank with buffers of the same size. If the staging buffer does
    /// not fit, all of them fall back to the transport. The staging buffer is
    /// released on return, whatever the outcome; earlier heap allocations
    /// are left alone.
    pub fn send_to_recv_from<T: Pod>(
        &self,
        send: &[T],
        dest: usize,
        recv: &mut [T],
        source: usize,
        tag: i32,
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(send);
        trace!(dest, source, tag, bytes = bytes.len(), "plane exchange");

        let Some(shm) = &self.shm else {
            return self.comm.sendrecv_bytes(
                bytes,
                dest,
                bytemuck::cast_slice_mut(recv),
                source,
                tag,
            );
        };

        let _staging_release = shm.heap_mark();
        let staging = match shm.buffer_malloc(bytes.len()) {
            Ok(ptr) => ptr,
            Err(Error::ShmHeapExhausted {
                requested,
                available,
            }) => {
                warn!(
                    requested,
                    available, "shared staging buffer does not fit, using transport"
                );
                return self.comm.sendrecv_bytes(
                    bytes,
                    dest,
                    bytemuck::cast_slice_mut(recv),
                    source,
                    tag,
                );
            }
            Err(e) => return Err(e),
        };

        if shm.is_on_node(dest) {
            shm.write_bytes(staging, bytes)?;
        } else {
            self.comm.send_bytes(bytes, dest, tag)?;
        }
        shm.barrier()?;

        let recv_bytes: &mut [u8] = bytemuck::cast_slice_mut(recv);
        if source == self.rank() {
            shm.read_bytes(staging, recv_bytes)?;
        } else if shm.is_on_node(source) {
            let peer = shm
                .translate_address(source, staging)?
                .ok_or(Error::InvalidRank(source))?;
            shm.read_bytes(peer, recv_bytes)?;
        } else {
            self.comm.recv_bytes(recv_bytes, source, tag)?;
        }
        shm.barrier()

    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::fabric::Fabric;

    #[test]
    fn grid_must_cover_communicator() {
        let fabric = Fabric::uniform(1, 4).unwrap();
        let out = fabric
            .run(|world| CartesianCommunicator::new(world, &[2, 3]).err())
            .unwrap();
        assert!(out
            .iter()
            .all(|e| matches!(e, Some(Error::ProcessorGridMismatch { world_size: 4, .. }))));
    }

    #[test]
    fn shifted_ranks_are_periodic() {
        let fabric = Fabric::uniform(1, 6).unwrap();
        let out = fabric
            .run(|world| {
                let cart = CartesianCommunicator::new(world, &[3, 2]).unwrap();
                (
                    cart.processor_coor().to_vec(),
                    cart.shifted_ranks(0, 1),
                    cart.shifted_ranks(1, 1),
                    cart.shifted_ranks(0, 3),
                )
            })
            .unwrap();
        // Rank 0 sits at (0, 0); last dimension fastest.
        assert_eq!(out[0].0, vec![0, 0]);
        assert_eq!(out[1].0, vec![0, 1]);
        assert_eq!(out[0].1, (4, 2));
        assert_eq!(out[0].2, (1, 1));
        assert_eq!(out[0].3, (0, 0));
    }

    #[test]
    fn transport_exchange_without_shared_memory() {
        let fabric = Fabric::uniform(2, 1).unwrap();
        let out = fabric
            .run(|world| {
                let cart = CartesianCommunicator::new(world, &[2]).unwrap();
                let (to, from) = cart.shifted_ranks(0, 1);
                let send = [cart.rank() as f64 + 0.5; 3];
                let mut recv = [0.0f64; 3];
                cart.send_to_recv_from(&send, to, &mut recv, from, 1).unwrap();
                recv[2]
            })
            .unwrap();
        assert_eq!(out, vec![1.5, 0.5]);
    }

    #[test]
    fn staging_buffer_is_released_on_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ShmConfig::default()
            .with_bytes(1 << 12)
            .with_dir(dir.path())
            .with_prefix("staging");
        let fabric = Fabric::uniform(1, 2).unwrap();
        let out = fabric
            .run(|world| -> Result<_> {
                let gsm = GlobalSharedMemory::bootstrap(world, cfg.clone())?;
                let cart = CartesianCommunicator::new(gsm.optimal_communicator(&[2])?, &[2])?
                    .with_shared_memory(&gsm)?;
                let shm = cart.shared_memory().ok_or(Error::NotAllocated)?;

                // A caller allocation made before the exchange must survive it.
                let mine = shm.buffer_malloc(100)?;
                shm.write_bytes(mine, &[cart.rank() as u8 + 1; 100])?;
                let before = shm.heap_used();

                let (to, from) = cart.shifted_ranks(0, 1);
                let send = [cart.rank() as u32 + 10; 8];
                let mut recv = [0u32; 8];
                cart.send_to_recv_from(&send, to, &mut recv, from, 4)?;
                let after = shm.heap_used();

                let failed = cart.send_to_recv_from(&send, 7, &mut recv, from, 5).err();
                let after_failure = shm.heap_used();

                let mut kept = [0u8; 100];
                shm.read_bytes(mine, &mut kept)?;
                Ok((before, after, after_failure, recv[0], kept[99], failed))
            })
            .unwrap();

        for (rank, r) in out.into_iter().enumerate() {
            let (before, after, after_failure, got, kept, failed) = r.unwrap();
            assert_eq!(before, 128);
            assert_eq!(after, before);
            assert_eq!(after_failure, before);
            assert_eq!(got, 10 + (rank as u32 + 1) % 2);
            assert_eq!(kept, rank as u8 + 1);
            assert!(matches!(failed, Some(Error::InvalidRank(7))), "{failed:?}");
        }
    }
}
