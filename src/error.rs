//! Error types for ferrolattice
//!
//! Every error in this crate describes a precondition violation of a
//! collective computation: a misconfigured launch, a shared-memory setup
//! failure or a transport fault. None of them is meant to be retried; callers
//! are expected to abort the job.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for lattice communication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for bootstrap, shared memory and shift operations
#[derive(Error, Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    /// Node groups reported by the transport have different sizes
    #[error("uneven node topology: node group sizes {sizes:?}")]
    UnevenTopology {
        /// Size of every node group, in leader order
        sizes: Vec<usize>,
    },

    /// Node group size is not a supported power of two
    #[error("node group size {size} is not a power of two up to 2^{max_log2}")]
    NodeSizeNotPowerOfTwo {
        /// Ranks per node
        size: usize,
        /// Platform ceiling on log2(ranks per node)
        max_log2: u32,
    },

    /// Product of the processor grid does not match the world size
    #[error("processor grid {processors:?} does not cover {world_size} ranks")]
    ProcessorGridMismatch {
        /// Requested processor grid
        processors: Vec<usize>,
        /// Number of ranks in the world group
        world_size: usize,
    },

    /// Node topology has already been resolved for this bootstrap object
    #[error("shared memory topology has already been initialized")]
    AlreadyInitialized,

    /// Node topology has not been resolved yet
    #[error("shared memory topology has not been initialized")]
    NotInitialized,

    /// Shared windows have already been allocated on this node
    #[error("shared memory windows have already been allocated")]
    AlreadyAllocated,

    /// Shared windows have not been allocated yet
    #[error("shared memory windows have not been allocated")]
    NotAllocated,

    /// This rank's leader was not found among the gathered leaders
    #[error("could not resolve home node for leader rank {leader}")]
    HomeNodeUnresolved {
        /// World rank of this rank's node leader
        leader: usize,
    },

    /// Grid dimensions, SIMD layout or processor grid are inconsistent
    #[error("invalid grid layout: {0}")]
    InvalidLayout(String),

    /// Two lattices passed to one operation live on different grids
    #[error("lattices are defined on different grids")]
    GridMismatch,

    /// Requested shared allocation size is unusable
    #[error("invalid shared memory allocation of {0} bytes")]
    InvalidAllocation(usize),

    /// A lane rotation was requested on a pattern that can only exchange pairs
    #[error("lane rotation by {slice} over {lanes} lanes requires a rotating permute pattern")]
    RotationUnsupported {
        /// Requested rotation
        slice: usize,
        /// Lanes along the dimension
        lanes: usize,
    },

    /// Configuration value could not be parsed
    #[error("invalid configuration {key}={value}")]
    InvalidConfig {
        /// Environment variable or option name
        key: String,
        /// Offending value
        value: String,
    },

    // ------------------------------------------------------------------
    // Shared memory resources
    // ------------------------------------------------------------------
    /// Creating or opening a named shared region failed
    #[error("failed to open shared region {}: {source}", name.display())]
    ShmOpen {
        /// Path of the region
        name: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Mapping a named shared region failed
    #[error("failed to map shared region {}: {source}", name.display())]
    ShmMap {
        /// Path of the region
        name: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A mapped region is not 64-byte aligned
    #[error("shared region {} mapped at misaligned address {address:#x}", name.display())]
    Misaligned {
        /// Path of the region
        name: PathBuf,
        /// Base address of the mapping
        address: usize,
    },

    /// Shared heap inside the window is full
    #[error("shared heap exhausted: requested {requested} bytes, {available} available")]
    ShmHeapExhausted {
        /// Requested bytes
        requested: usize,
        /// Bytes left in the heap
        available: usize,
    },

    // ------------------------------------------------------------------
    // Address translation
    // ------------------------------------------------------------------
    /// Translating a pointer to the caller's own window
    #[error("cannot translate a shared pointer to the calling rank {0}")]
    SelfTranslate(usize),

    /// Pointer does not lie in the caller's own window
    #[error("pointer into window {window} is not in the local window {local}")]
    NotLocalPointer {
        /// Window the pointer refers to
        window: usize,
        /// The caller's own window
        local: usize,
    },

    /// Access past the end of a shared window
    #[error("range {offset}..{end} exceeds shared window of {len} bytes")]
    OutOfWindow {
        /// Start offset
        offset: usize,
        /// End offset
        end: usize,
        /// Window length
        len: usize,
    },

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// Invalid rank specified
    #[error("invalid rank: {0}")]
    InvalidRank(usize),

    /// Received message carried an unexpected tag
    #[error("tag mismatch from rank {source_rank}: expected {expected}, got {found}")]
    TagMismatch {
        /// Sending rank
        source_rank: usize,
        /// Tag requested by the receiver
        expected: i32,
        /// Tag carried by the message
        found: i32,
    },

    /// Received message has a different length than the receive buffer
    #[error("message size mismatch: expected {expected} bytes, got {found}")]
    SizeMismatch {
        /// Receive buffer size
        expected: usize,
        /// Message size
        found: usize,
    },

    /// Peer endpoint went away
    #[error("transport disconnected")]
    Disconnected,

    /// Peer rank left the computation before sending an expected message
    #[error("rank {0} exited before sending an expected message")]
    RankAborted(usize),

    /// A rank thread of the fabric panicked
    #[error("rank {0} panicked")]
    RankPanicked(usize),

    // ------------------------------------------------------------------
    // Self test
    // ------------------------------------------------------------------
    /// Shared memory readback did not match what was written
    #[error("shared memory self test failed: window {window} word {word} expected {expected:#x}, found {found:#x}")]
    SelfTestMismatch {
        /// Window index within the node
        window: usize,
        /// Word index within the tag
        word: usize,
        /// Value written
        expected: u64,
        /// Value read back
        found: u64,
    },
}

impl Error {
    /// Check a boolean layout condition, producing [`Error::InvalidLayout`].
    pub(crate) fn check_layout(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
        if cond {
            Ok(())
        } else {
            Err(Error::InvalidLayout(msg()))
        }
    }
}
