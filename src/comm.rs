//! The message-passing transport seam.
//!
//! Everything in this crate that talks to other ranks does so through the
//! [`Communicator`] trait. The trait mirrors the small subset of MPI that the
//! shared-memory bootstrap and the shift engine need: rank/size queries,
//! locality and color splits, group rank translation, a sum all-reduce, a
//! barrier and tagged point-to-point byte transfers.
//!
//! [`ThreadComm`](crate::ThreadComm) is the in-crate implementation; a host
//! application can implement the trait over its own MPI binding.

use crate::error::Result;

/// Color used when splitting a communicator.
///
/// `Color::UNDEFINED` excludes the calling rank from every resulting group,
/// like `MPI_UNDEFINED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Color(Option<usize>);

impl Color {
    /// The calling rank takes part in no sub-communicator.
    pub const UNDEFINED: Color = Color(None);

    /// A defined color.
    pub fn with_value(value: usize) -> Self {
        Color(Some(value))
    }

    /// The color value, `None` for [`Color::UNDEFINED`].
    pub fn value(self) -> Option<usize> {
        self.0
    }
}

/// A group of ranks that can exchange messages.
///
/// # Semantics
///
/// - Collective calls ([`barrier`](Self::barrier),
///   [`allreduce_sum`](Self::allreduce_sum), [`split`](Self::split),
///   [`split_shared`](Self::split_shared)) must be entered by every rank of
///   the communicator in the same order.
/// - [`send_bytes`](Self::send_bytes) is buffered: it returns without waiting
///   for the matching receive. Messages between a given pair of ranks are
///   delivered in order.
pub trait Communicator: Sized {
    /// Rank of the calling process in this communicator.
    fn rank(&self) -> usize;

    /// Number of processes in this communicator.
    fn size(&self) -> usize;

    // ========================================================================
    // Communicator management
    // ========================================================================

    /// Partition the communicator by color; ranks are ordered by `key`, ties
    /// broken by the rank in this communicator.
    ///
    /// Returns `None` on ranks that passed [`Color::UNDEFINED`].
    fn split(&self, color: Color, key: usize) -> Result<Option<Self>>;

    /// Partition the communicator into groups of ranks that can share
    /// memory. Rank order inside a group follows rank order in `self`.
    fn split_shared(&self) -> Result<Self>;

    /// For every rank of `self`, its rank in `other`, or `None` when that
    /// process is not a member of `other`.
    fn translate_ranks(&self, other: &Self) -> Result<Vec<Option<usize>>>;

    // ========================================================================
    // Synchronization and collectives
    // ========================================================================

    /// Barrier synchronization.
    fn barrier(&self) -> Result<()>;

    /// Element-wise sum of `data` across all ranks, in place.
    fn allreduce_sum(&self, data: &mut [u64]) -> Result<()>;

    // ========================================================================
    // Point-to-point
    // ========================================================================

    /// Send `data` to `dest` with `tag`.
    fn send_bytes(&self, data: &[u8], dest: usize, tag: i32) -> Result<()>;

    /// Receive exactly `data.len()` bytes from `source` with `tag`.
    fn recv_bytes(&self, data: &mut [u8], source: usize, tag: i32) -> Result<()>;

    /// Send to one rank and receive from another.
    ///
    /// The default implementation relies on buffered sends.
    fn sendrecv_bytes(
        &self,
        send: &[u8],
        dest: usize,
        recv: &mut [u8],
        source: usize,
        tag: i32,
    ) -> Result<()> {
        self.send_bytes(send, dest, tag)?;
        self.recv_bytes(recv, source, tag)
    }
}
