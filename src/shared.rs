//! Node shared memory bound to an arbitrary communicator.
//!
//! [`SharedMemory::bind`] maps the node windows allocated by
//! [`GlobalSharedMemory`] onto the ranks of a sub-communicator (for example
//! the reordered communicator from
//! [`optimal_communicator`](GlobalSharedMemory::optimal_communicator)). Every
//! on-node rank of that communicator can then be reached through its window.
//!
//! Pointers into windows are [`WindowPtr`] values: a window (comm rank) plus a
//! byte offset. Translating a pointer between windows is offset arithmetic;
//! no absolute address ever leaves the process that mapped it.

use std::cell::Cell;
use std::sync::Arc;

use tracing::debug;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::window::{GlobalSharedMemory, ShmRegion, WINDOW_ALIGN};

/// Marker word written by [`SharedMemory::shared_memory_test`].
pub const SELF_TEST_MAGIC: u64 = 0x5A5A5A;

/// A location inside the shared window of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowPtr {
    /// Rank (in the bound communicator) owning the window.
    pub rank: usize,
    /// Byte offset from the window base.
    pub offset: usize,
}

impl WindowPtr {
    /// Pointer `bytes` further into the same window.
    pub fn add(self, bytes: usize) -> Self {
        WindowPtr {
            rank: self.rank,
            offset: self.offset + bytes,
        }
    }
}

/// Rolls the shared heap back to a saved top on drop.
pub(crate) struct HeapMark<'a> {
    top: &'a Cell<usize>,
    mark: usize,
}

impl Drop for HeapMark<'_> {
    fn drop(&mut self) {
        self.top.set(self.mark);
    }
}

/// Node windows as seen from one communicator.
///
/// Also carries a bump heap over the caller's own window. All on-node ranks
/// perform the same sequence of [`buffer_malloc`](Self::buffer_malloc) calls,
/// so equal offsets name matching buffers in every window.
pub struct SharedMemory<C: Communicator> {
    rank: usize,
    size: usize,
    node: C,
    node_index: usize,
    /// Window of every node slot of `node`.
    windows: Vec<Arc<ShmRegion>>,
    /// Node slot of every comm rank, `None` if off-node.
    slots: Vec<Option<usize>>,
    heap_top: Cell<usize>,
}

impl<C: Communicator> SharedMemory<C> {
    /// Bind the node windows of `global` to the ranks of `comm`.
    ///
    /// Collective over `comm`.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] / [`Error::NotAllocated`] if the bootstrap is
    /// incomplete, or any transport error.
    pub fn bind(global: &GlobalSharedMemory<C>, comm: &C) -> Result<Self> {
        let topology = global.topology()?;
        let node_windows = global.windows()?;
        let node = comm.split_shared()?;

        // Each slot sums to the world node rank of its owner.
        let mut owners = vec![0u64; node.size()];
        owners[node.rank()] = topology.node_rank as u64;
        node.allreduce_sum(&mut owners)?;

        let windows = owners
            .iter()
            .map(|&w| {
                node_windows
                    .get(w as usize)
                    .cloned()
                    .ok_or(Error::InvalidRank(w as usize))
            })
            .collect::<Result<Vec<_>>>()?;
        let slots = comm.translate_ranks(&node)?;

        debug!(
            rank = comm.rank(),
            node_rank = node.rank(),
            node_size = node.size(),
            node_index = topology.node_index,
            ?owners,
            "bound shared memory to communicator"
        );

        Ok(SharedMemory {
            rank: comm.rank(),
            size: comm.size(),
            node,
            node_index: topology.node_index,
            windows,
            slots,
            heap_top: Cell::new(0),
        })
    }

    /// Rank of the caller in the bound communicator.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Size of the bound communicator.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Rank of the caller among the on-node ranks of the communicator.
    pub fn node_rank(&self) -> usize {
        self.node.rank()
    }

    /// Number of on-node ranks of the communicator.
    pub fn node_size(&self) -> usize {
        self.node.size()
    }

    /// Dense index of the caller's node.
    pub fn node_index(&self) -> usize {
        self.node_index
    }

    /// Barrier over the on-node ranks of the communicator.
    pub fn barrier(&self) -> Result<()> {
        self.node.barrier()
    }

    /// Whether comm rank `rank` shares this node.
    pub fn is_on_node(&self, rank: usize) -> bool {
        self.slots.get(rank).is_some_and(Option::is_some)
    }

    /// Window of comm rank `rank`, or `None` if it lives on another node.
    pub fn buffer_for(&self, rank: usize) -> Option<&ShmRegion> {
        let slot = (*self.slots.get(rank)?)?;
        self.windows.get(slot).map(|w| &**w)
    }

    /// The caller's own window.
    pub fn local_window(&self) -> &ShmRegion {
        &self.windows[self.node.rank()]
    }

    /// Pointer at `offset` inside the caller's own window.
    pub fn local_ptr(&self, offset: usize) -> WindowPtr {
        WindowPtr {
            rank: self.rank,
            offset,
        }
    }

    /// Translate `ptr`, which must point into the caller's window, into the
    /// same location in the window of `rank`.
    ///
    /// Returns `Ok(None)` if `rank` is not on this node.
    ///
    /// # Errors
    ///
    /// - [`Error::SelfTranslate`] if `rank` is the caller
    /// - [`Error::NotLocalPointer`] if `ptr` is not in the caller's window
    /// - [`Error::OutOfWindow`] if `ptr` is past the end of the window
    pub fn translate_address(&self, rank: usize, ptr: WindowPtr) -> Result<Option<WindowPtr>> {
        if rank == self.rank {
            return Err(Error::SelfTranslate(rank));
        }
        if ptr.rank != self.rank {
            return Err(Error::NotLocalPointer {
                window: ptr.rank,
                local: self.rank,
            });
        }
        let len = self.local_window().len();
        if ptr.offset >= len {
            return Err(Error::OutOfWindow {
                offset: ptr.offset,
                end: ptr.offset + 1,
                len,
            });
        }
        if rank >= self.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(self.buffer_for(rank).map(|_| WindowPtr {
            rank,
            offset: ptr.offset,
        }))
    }

    /// Copy `data` into the window `ptr` points to.
    pub fn write_bytes(&self, ptr: WindowPtr, data: &[u8]) -> Result<()> {
        self.region(ptr)?.write(ptr.offset, data)
    }

    /// Copy from the window `ptr` points to into `data`.
    pub fn read_bytes(&self, ptr: WindowPtr, data: &mut [u8]) -> Result<()> {
        self.region(ptr)?.read(ptr.offset, data)
    }

    fn region(&self, ptr: WindowPtr) -> Result<&ShmRegion> {
        self.buffer_for(ptr.rank).ok_or(Error::InvalidRank(ptr.rank))
    }

    // ========================================================================
    // Shared heap
    // ========================================================================

    /// Bytes available to the shared heap.
    pub fn heap_size(&self) -> usize {
        self.local_window().len()
    }

    /// Bytes currently handed out by the shared heap.
    pub fn heap_used(&self) -> usize {
        self.heap_top.get()
    }

    /// Reserve `bytes` (rounded up to 64) in the caller's window.
    ///
    /// # Errors
    ///
    /// [`Error::ShmHeapExhausted`] if the window has no room left.
    pub fn buffer_malloc(&self, bytes: usize) -> Result<WindowPtr> {
        let top = self.heap_top.get();
        let available = self.heap_size() - top;
        let rounded = bytes
            .checked_add(WINDOW_ALIGN - 1)
            .map(|b| b & !(WINDOW_ALIGN - 1))
            .filter(|&b| b <= available)
            .ok_or(Error::ShmHeapExhausted {
                requested: bytes,
                available,
            })?;
        self.heap_top.set(top + rounded);
        Ok(self.local_ptr(top))
    }

    /// Release every shared heap allocation.
    pub fn buffer_free_all(&self) {
        self.heap_top.set(0);
    }

    /// Remember the current heap top; allocations made after this point are
    /// released when the mark is dropped.
    pub(crate) fn heap_mark(&self) -> HeapMark<'_> {
        HeapMark {
            top: &self.heap_top,
            mark: self.heap_top.get(),
        }
    }

    // ========================================================================
    // Self test
    // ========================================================================

    /// Check that every on-node window is coherent across ranks.
    ///
    /// Node rank 0 writes `[node index, slot, 0x5A5A5A]` at the start of
    /// every window; after a barrier every rank reads all of them back.
    /// Collective over the on-node ranks.
    ///
    /// # Errors
    ///
    /// [`Error::SelfTestMismatch`] for the first word that does not read back.
    pub fn shared_memory_test(&self) -> Result<()> {
        self.barrier()?;
        if self.node.rank() == 0 {
            for (slot, window) in self.windows.iter().enumerate() {
                let words = self.self_test_words(slot);
                window.write(0, bytemuck::cast_slice(&words))?;
            }
        }
        self.barrier()?;
        let verdict = self.verify_self_test();
        self.barrier()?;
        verdict
    }

    fn self_test_words(&self, slot: usize) -> [u64; 3] {
        [self.node_index as u64, slot as u64, SELF_TEST_MAGIC]
    }

    fn verify_self_test(&self) -> Result<()> {
        for (slot, window) in self.windows.iter().enumerate() {
            let mut found = [0u64; 3];
            window.read(0, bytemuck::cast_slice_mut(&mut found))?;
            let expected = self.self_test_words(slot);
            if let Some(word) = (0..3).find(|&i| found[i] != expected[i]) {
                return Err(Error::SelfTestMismatch {
                    window: slot,
                    word,
                    expected: expected[word],
                    found: found[word],
                });
            }
        }
        Ok(())
    }
}
