//! Node shared-memory windows and the process-wide bootstrap object.
//!
//! [`GlobalSharedMemory`] owns the world communicator, its locality split,
//! the resolved [`NodeTopology`] and the node windows. It has an explicit
//! two-phase lifecycle:
//!
//! 1. [`init()`](GlobalSharedMemory::init) resolves the node topology;
//! 2. [`allocate()`](GlobalSharedMemory::allocate) maps one [`ShmRegion`] per
//!    node rank into every rank of the node.
//!
//! Each phase runs exactly once per bootstrap object; repeating it is an
//! error. Sub-communicators reach the windows through
//! [`SharedMemory`](crate::SharedMemory).
//!
//! # Example
//!
//! ```
//! use ferrolattice::{Fabric, GlobalSharedMemory, ShmConfig};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = ShmConfig::default()
//!     .with_bytes(4096)
//!     .with_dir(dir.path())
//!     .with_prefix("doc_window");
//! let fabric = Fabric::uniform(1, 2).unwrap();
//! fabric
//!     .run(|world| {
//!         let mut gsm = GlobalSharedMemory::new(world, config.clone());
//!         gsm.init().unwrap();
//!         gsm.allocate(4096, false).unwrap();
//!         assert_eq!(gsm.windows().unwrap().len(), 2);
//!     })
//!     .unwrap();
//! ```

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::comm::{Color, Communicator};
use crate::config::{ShmBackend, ShmConfig};
use crate::error::{Error, Result};
use crate::topology::NodeTopology;

/// Required alignment of every window base.
pub const WINDOW_ALIGN: usize = 64;

/// One named, memory-mapped region shared by all ranks of a node.
///
/// The mapping is released when the region is dropped; the rank that created
/// the region also removes its name from the filesystem at that point.
pub struct ShmRegion {
    path: PathBuf,
    /// Keeps the mapping alive; `base` points into it.
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    owner: bool,
}

// SAFETY: the mapping is plain shared memory that lives as long as the
// region. Concurrent access is coordinated by node barriers, never by the
// region itself.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

impl ShmRegion {
    /// Create (or truncate) the region at `path` and map it.
    fn create(path: &Path, bytes: usize, owner: bool) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale shared region"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::ShmOpen {
                    name: path.to_path_buf(),
                    source,
                })
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::ShmOpen {
                name: path.to_path_buf(),
                source,
            })?;
        Self::map(file, path, bytes, owner)
    }

    /// Open the region at `path`, creating it if no rank has yet, and map it.
    fn open_or_create(path: &Path, bytes: usize, owner: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| Error::ShmOpen {
                name: path.to_path_buf(),
                source,
            })?;
        Self::map(file, path, bytes, owner)
    }

    /// Attach to a region created by another rank.
    fn attach(path: &Path, bytes: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::ShmOpen {
                name: path.to_path_buf(),
                source,
            })?;
        Self::map(file, path, bytes, false)
    }

    fn map(file: File, path: &Path, bytes: usize, owner: bool) -> Result<Self> {
        let map_err = |source| Error::ShmMap {
            name: path.to_path_buf(),
            source,
        };
        let current = file.metadata().map_err(map_err)?.len();
        if current < bytes as u64 {
            file.set_len(bytes as u64).map_err(map_err)?;
        }

        // SAFETY: the file is sized to at least `bytes`, and the mapping is
        // only ever accessed through raw pointers under barrier discipline.
        let mut map = unsafe {
            MmapOptions::new()
                .len(bytes)
                .populate()
                .map_mut(&file)
                .map_err(map_err)?
        };
        // The descriptor is not needed once mapped.
        drop(file);

        let address = map.as_mut_ptr() as usize;
        if address % WINDOW_ALIGN != 0 {
            return Err(Error::Misaligned {
                name: path.to_path_buf(),
                address,
            });
        }
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| Error::ShmMap {
            name: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "null mapping"),
        })?;

        Ok(ShmRegion {
            path: path.to_path_buf(),
            _map: map,
            base,
            len: bytes,
            owner,
        })
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for an allocated window).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Filesystem name of the region.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base address of the mapping in this process.
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Copy `src` into the region at `offset`.
    pub(crate) fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: the range is inside the mapping; callers separate writers
        // and readers of the same range with node barriers.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
        Ok(())
    }

    /// Copy from the region at `offset` into `dst`.
    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: as for `write`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfWindow {
                offset,
                end: offset.saturating_add(len),
                len: self.len,
            }),
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            // Another owner may already have cleaned up a shared name.
            let _ = fs::remove_file(&self.path);
        }
    }
}

struct Bootstrap<C> {
    node: C,
    topology: NodeTopology,
    windows: Option<Vec<Arc<ShmRegion>>>,
}

/// Process-wide shared-memory bootstrap state.
pub struct GlobalSharedMemory<C: Communicator> {
    world: C,
    config: ShmConfig,
    state: Option<Bootstrap<C>>,
}

impl<C: Communicator> GlobalSharedMemory<C> {
    /// Wrap the world communicator; nothing is resolved yet.
    pub fn new(world: C, config: ShmConfig) -> Self {
        GlobalSharedMemory {
            world,
            config,
            state: None,
        }
    }

    /// Run both bootstrap phases with the configured size and hint.
    pub fn bootstrap(world: C, config: ShmConfig) -> Result<Self> {
        let (bytes, hugepages) = (config.bytes, config.hugepages);
        let mut gsm = Self::new(world, config);
        gsm.init()?;
        gsm.allocate(bytes, hugepages)?;
        Ok(gsm)
    }

    /// Resolve the node topology of the world group.
    ///
    /// Collective over the world communicator.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`] on a second call, or any topology error
    /// from [`NodeTopology::resolve`].
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let node = self.world.split_shared()?;
        let topology =
            NodeTopology::resolve(&self.world, &node, self.config.max_log2_ranks_per_node)?;
        self.state = Some(Bootstrap {
            node,
            topology,
            windows: None,
        });
        Ok(())
    }

    /// Map one window of `bytes` per node rank into every rank of the node.
    ///
    /// Collective over the node. A node barrier precedes and follows the
    /// mapping, so on return every rank sees every window of its node.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] before [`init()`](Self::init)
    /// - [`Error::AlreadyAllocated`] on a second call
    /// - [`Error::InvalidAllocation`] for a zero size
    /// - [`Error::ShmOpen`], [`Error::ShmMap`], [`Error::Misaligned`] when a
    ///   region cannot be set up
    pub fn allocate(&mut self, bytes: usize, hugepages: bool) -> Result<()> {
        let config = self.config.clone().with_hugepages(hugepages);
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        if state.windows.is_some() {
            return Err(Error::AlreadyAllocated);
        }
        if bytes == 0 {
            return Err(Error::InvalidAllocation(bytes));
        }

        let topo = &state.topology;
        let node = &state.node;
        info!(
            bytes,
            hugepages,
            backend = ?config.backend,
            node = topo.node_index,
            dir = %config.region_dir().display(),
            "allocating shared memory windows"
        );

        node.barrier()?;
        let paths: Vec<PathBuf> = (0..topo.node_size)
            .map(|r| config.region_path(topo.node_index, r))
            .collect();

        let windows: Vec<Arc<ShmRegion>> = match config.backend {
            ShmBackend::PerRankMmap => paths
                .iter()
                .enumerate()
                .map(|(r, path)| {
                    ShmRegion::open_or_create(path, bytes, r == topo.node_rank).map(Arc::new)
                })
                .collect::<Result<_>>()?,
            ShmBackend::SingleCreator if topo.node_rank == 0 => {
                let created = paths
                    .iter()
                    .map(|path| ShmRegion::create(path, bytes, true).map(Arc::new))
                    .collect::<Result<Vec<_>>>()?;
                node.barrier()?;
                created
            }
            ShmBackend::SingleCreator => {
                node.barrier()?;
                paths
                    .iter()
                    .map(|path| ShmRegion::attach(path, bytes).map(Arc::new))
                    .collect::<Result<_>>()?
            }
        };
        for (r, w) in windows.iter().enumerate() {
            debug!(window = r, path = %w.path().display(), len = w.len(), "mapped shared window");
        }
        node.barrier()?;

        state.windows = Some(windows);
        Ok(())
    }

    /// The world communicator.
    pub fn world(&self) -> &C {
        &self.world
    }

    /// The bootstrap configuration.
    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    /// The resolved node topology.
    pub fn topology(&self) -> Result<&NodeTopology> {
        self.state
            .as_ref()
            .map(|s| &s.topology)
            .ok_or(Error::NotInitialized)
    }

    /// The locality split of the world communicator.
    pub fn node_comm(&self) -> Result<&C> {
        self.state
            .as_ref()
            .map(|s| &s.node)
            .ok_or(Error::NotInitialized)
    }

    /// The node windows, indexed by node rank.
    pub fn windows(&self) -> Result<&[Arc<ShmRegion>]> {
        self.state
            .as_ref()
            .ok_or(Error::NotInitialized)?
            .windows
            .as_deref()
            .ok_or(Error::NotAllocated)
    }

    /// Bytes per window.
    pub fn window_bytes(&self) -> Result<usize> {
        Ok(self.windows()?.first().map_or(0, |w| w.len()))
    }

    /// A communicator over the world group renumbered so that the ranks of
    /// one node form a compact block of the Cartesian `processors` grid.
    ///
    /// Collective over the world communicator.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessorGridMismatch`] if `processors` does not cover the
    /// world group, or [`Error::NodeSizeNotPowerOfTwo`].
    pub fn optimal_communicator(&self, processors: &[usize]) -> Result<C> {
        let topo = self.topology()?;
        let rank = topo.layout_rank(processors, self.config.max_log2_ranks_per_node)?;
        debug!(
            world_rank = topo.world_rank,
            rank,
            ?processors,
            "node-aware layout rank"
        );
        self.world
            .split(Color::with_value(0), rank)?
            .ok_or(Error::InvalidRank(rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_maps_aligned_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit_region");
        {
            let region = ShmRegion::create(&path, 4096, true).unwrap();
            assert_eq!(region.len(), 4096);
            assert_eq!(region.base() as usize % WINDOW_ALIGN, 0);
            region.write(8, &[1, 2, 3]).unwrap();

            let peer = ShmRegion::attach(&path, 4096).unwrap();
            let mut buf = [0u8; 3];
            peer.read(8, &mut buf).unwrap();
            assert_eq!(buf, [1, 2, 3]);
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn region_bounds_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(&dir.path().join("bounds"), 128, true).unwrap();
        assert!(region.write(120, &[0; 8]).is_ok());
        assert!(matches!(
            region.write(121, &[0; 8]),
            Err(Error::OutOfWindow { offset: 121, end: 129, len: 128 })
        ));
        assert!(region.check_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn attach_to_missing_region_reports_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        match ShmRegion::attach(&path, 64) {
            Err(Error::ShmOpen { name, .. }) => assert_eq!(name, path),
            other => panic!("unexpected {other:?}"),
        }
    }
}
