//! Node topology resolution and node-aware rank layout.
//!
//! [`NodeTopology::resolve`] partitions the world group into nodes, elects the
//! smallest world rank of every node as its leader and numbers the nodes
//! densely in leader order. [`layout_rank`] turns that topology into a rank
//! permutation for a Cartesian processor grid, spreading the ranks of one node
//! over a compact sub-block of the grid so that as much nearest-neighbour
//! traffic as possible stays on the node.
//!
//! Coordinates are encoded and decoded in reversed lexicographic order: the
//! last dimension varies fastest.

use tracing::debug;

use crate::comm::Communicator;
use crate::error::{Error, Result};

/// Where the calling rank sits in the node decomposition of the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    /// Rank in the world group.
    pub world_rank: usize,
    /// Size of the world group.
    pub world_size: usize,
    /// Rank within this node.
    pub node_rank: usize,
    /// Ranks per node (identical on every node).
    pub node_size: usize,
    /// Dense index of this node, in ascending leader order.
    pub node_index: usize,
    /// Number of nodes.
    pub nodes: usize,
    /// World ranks on this node, ascending; the first is the leader.
    pub node_members: Vec<usize>,
    /// World rank of every node's leader, ascending (index = node index).
    pub leaders: Vec<usize>,
    /// For every world rank, its rank in this node, `None` if off-node.
    pub world_node_ranks: Vec<Option<usize>>,
}

impl NodeTopology {
    /// Resolve the node topology from the world group and the locality split
    /// of it (`node` must be `world.split_shared()`).
    ///
    /// This is collective over `world`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnevenTopology`] if nodes differ in size
    /// - [`Error::NodeSizeNotPowerOfTwo`] if the node size is not `2^L` with
    ///   `L <= max_log2`
    /// - [`Error::HomeNodeUnresolved`] if this rank's leader is missing from
    ///   the gathered leader list
    pub fn resolve<C: Communicator>(world: &C, node: &C, max_log2: u32) -> Result<Self> {
        let world_rank = world.rank();
        let world_size = world.size();
        let node_rank = node.rank();
        let node_size = node.size();

        let world_node_ranks = world.translate_ranks(node)?;
        let node_members: Vec<usize> = world_node_ranks
            .iter()
            .enumerate()
            .filter_map(|(w, r)| r.map(|_| w))
            .collect();
        if node_members.len() != node_size {
            return Err(Error::UnevenTopology {
                sizes: vec![node_members.len(), node_size],
            });
        }
        let leader = node_members[0];

        // Every rank adds one at its leader's slot: the sum is the node size
        // at every leader and zero elsewhere.
        let mut counts = vec![0u64; world_size];
        counts[leader] = 1;
        world.allreduce_sum(&mut counts)?;

        let leaders: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c != 0)
            .map(|(l, _)| l)
            .collect();
        let sizes: Vec<usize> = leaders.iter().map(|&l| counts[l] as usize).collect();
        if sizes.iter().any(|&s| s != node_size) {
            return Err(Error::UnevenTopology { sizes });
        }
        log2_exact(node_size, max_log2)?;

        let node_index = leaders
            .iter()
            .position(|&l| l == leader)
            .ok_or(Error::HomeNodeUnresolved { leader })?;

        debug!(
            world_rank,
            world_size,
            node_rank,
            node_size,
            node_index,
            nodes = leaders.len(),
            "resolved node topology"
        );

        Ok(NodeTopology {
            world_rank,
            world_size,
            node_rank,
            node_size,
            node_index,
            nodes: leaders.len(),
            node_members,
            leaders,
            world_node_ranks,
        })
    }

    /// World rank of this node's leader.
    pub fn leader(&self) -> usize {
        self.node_members[0]
    }

    /// Whether `world_rank` lives on this node.
    pub fn is_on_node(&self, world_rank: usize) -> bool {
        self.world_node_ranks
            .get(world_rank)
            .is_some_and(Option::is_some)
    }

    /// New rank of this process in the node-aware layout of `processors`.
    pub fn layout_rank(&self, processors: &[usize], max_log2: u32) -> Result<usize> {
        layout_rank(
            processors,
            self.world_size,
            self.node_size,
            self.node_index,
            self.node_rank,
            max_log2,
        )
    }
}

/// `L` such that `size == 2^L`, for `L <= max_log2`.
pub fn log2_exact(size: usize, max_log2: u32) -> Result<u32> {
    (0..=max_log2)
        .find(|&l| 1usize.checked_shl(l) == Some(size))
        .ok_or(Error::NodeSizeNotPowerOfTwo { size, max_log2 })
}

/// Shared-memory extent per dimension for `2^log2_node` ranks per node.
///
/// The bits are handed out round-robin, skipping dimensions that have no
/// room left, so on-node adjacency is spread over all axes.
pub fn shm_dims(processors: &[usize], log2_node: u32) -> Result<Vec<usize>> {
    let nd = processors.len();
    let mut shm = vec![1usize; nd];
    if log2_node == 0 {
        return Ok(shm);
    }
    Error::check_layout(nd > 0, || "empty processor grid".into())?;
    let mut dim = 0;
    for _ in 0..log2_node {
        let mut tried = 0;
        while processors[dim] / shm[dim] <= 1 {
            dim = (dim + 1) % nd;
            tried += 1;
            Error::check_layout(tried <= nd, || {
                format!("processor grid {processors:?} cannot hold 2^{log2_node} ranks per node")
            })?;
        }
        shm[dim] *= 2;
        dim = (dim + 1) % nd;
    }
    for d in 0..nd {
        Error::check_layout(processors[d] % shm[d] == 0, || {
            format!(
                "processor extent {} in dimension {d} is not a multiple of node extent {}",
                processors[d], shm[d]
            )
        })?;
    }
    Ok(shm)
}

/// Rank of node rank `node_rank` of node `node_index` in the node-aware
/// layout of `processors`.
///
/// # Errors
///
/// - [`Error::ProcessorGridMismatch`] if the grid does not cover `world_size`
/// - [`Error::NodeSizeNotPowerOfTwo`] for an unsupported node size
pub fn layout_rank(
    processors: &[usize],
    world_size: usize,
    node_size: usize,
    node_index: usize,
    node_rank: usize,
    max_log2: u32,
) -> Result<usize> {
    let log2size = log2_exact(node_size, max_log2)?;

    let nprocessors: usize = processors.iter().product();
    if nprocessors != world_size || processors.is_empty() {
        return Err(Error::ProcessorGridMismatch {
            processors: processors.to_vec(),
            world_size,
        });
    }

    let shm = shm_dims(processors, log2size)?;
    let node_dims: Vec<usize> = processors.iter().zip(&shm).map(|(p, s)| p / s).collect();

    let node_coor = coor_from_index_reversed(node_index, &node_dims);
    let shm_coor = coor_from_index_reversed(node_rank, &shm);
    let world_coor: Vec<usize> = node_coor
        .iter()
        .zip(&shm_coor)
        .zip(&shm)
        .map(|((n, s), extent)| n * extent + s)
        .collect();
    Ok(index_from_coor_reversed(&world_coor, processors))
}

/// Decode `index` into coordinates over `dims`, last dimension fastest.
pub fn coor_from_index_reversed(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coor = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        coor[d] = index % dims[d];
        index /= dims[d];
    }
    coor
}

/// Encode coordinates over `dims` into an index, last dimension fastest.
pub fn index_from_coor_reversed(coor: &[usize], dims: &[usize]) -> usize {
    coor.iter()
        .zip(dims)
        .fold(0, |index, (c, d)| index * d + c)
}
