//! In-process transport: every rank is a thread.
//!
//! A [`Fabric`] describes a world of ranks and which node each rank lives
//! on. [`Fabric::run`] spawns one thread per rank and hands each a
//! [`ThreadComm`] for the world group. Shared-memory regions opened by the
//! threads are real file-backed mappings, so the bootstrap and the shift
//! engine exercise exactly the code paths they would across processes.
//!
//! Every communicator owns a matrix of unbounded channels, one per ordered
//! rank pair, separately for point-to-point traffic and for collectives.
//! Sends never block; per-pair ordering is FIFO.
//!
//! A rank that leaves [`Fabric::run`] early, by returning or panicking,
//! does not strand its peers: once the messages it already sent are drained,
//! a receive from it fails with [`Error::RankAborted`].
//!
//! # Example
//!
//! ```
//! use ferrolattice::{Communicator, Fabric};
//!
//! let fabric = Fabric::uniform(2, 2).unwrap();
//! let sums = fabric
//!     .run(|world| {
//!         let mut v = [world.rank() as u64];
//!         world.allreduce_sum(&mut v).unwrap();
//!         v[0]
//!     })
//!     .unwrap();
//! assert_eq!(sums, vec![6, 6, 6, 6]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::comm::{Color, Communicator};
use crate::error::{Error, Result};

const TAG_BARRIER: i32 = -1;
const TAG_ALLREDUCE: i32 = -2;
const TAG_SPLIT: i32 = -3;

enum Payload {
    Bytes(Vec<u8>),
    Words(Vec<u64>),
    Group(Option<Arc<Group>>),
}

struct Packet {
    tag: i32,
    payload: Payload,
}

#[derive(Clone, Copy)]
enum Lane {
    PointToPoint,
    Collective,
}

type Channel = (Sender<Packet>, Receiver<Packet>);

/// Channel matrix of one communicator, indexed `[dest][source]`.
struct Group {
    /// World rank of every member, in communicator rank order.
    members: Vec<usize>,
    p2p: Vec<Vec<Channel>>,
    coll: Vec<Vec<Channel>>,
}

impl Group {
    fn new(members: Vec<usize>) -> Arc<Self> {
        let n = members.len();
        let matrix = || -> Vec<Vec<Channel>> {
            (0..n)
                .map(|_| (0..n).map(|_| unbounded()).collect())
                .collect()
        };
        Arc::new(Group {
            members,
            p2p: matrix(),
            coll: matrix(),
        })
    }

    fn channel(&self, lane: Lane, dest: usize, source: usize) -> &Channel {
        match lane {
            Lane::PointToPoint => &self.p2p[dest][source],
            Lane::Collective => &self.coll[dest][source],
        }
    }
}

/// A world of thread ranks with a declared node placement.
#[derive(Debug, Clone)]
pub struct Fabric {
    /// Node id of every world rank.
    locality: Arc<Vec<usize>>,
}

impl Fabric {
    /// Build a fabric where world rank `r` lives on node `locality[r]`.
    ///
    /// Node ids are arbitrary labels; they need not be dense or sorted.
    pub fn new(locality: Vec<usize>) -> Result<Self> {
        if locality.is_empty() {
            return Err(Error::InvalidLayout("fabric needs at least one rank".into()));
        }
        Ok(Fabric {
            locality: Arc::new(locality),
        })
    }

    /// `nodes` nodes of `ranks_per_node` consecutive ranks each.
    pub fn uniform(nodes: usize, ranks_per_node: usize) -> Result<Self> {
        Self::new(
            (0..nodes * ranks_per_node)
                .map(|r| r / ranks_per_node)
                .collect(),
        )
    }

    /// Number of world ranks.
    pub fn size(&self) -> usize {
        self.locality.len()
    }

    /// One world communicator per rank, in rank order, and the liveness
    /// token of every rank. Dropping token `r` marks world rank `r` as gone.
    fn communicators(&self) -> (Vec<ThreadComm>, Vec<Sender<()>>) {
        let group = Group::new((0..self.size()).collect());
        let (tokens, exits): (Vec<_>, Vec<_>) = (0..self.size()).map(|_| bounded(0)).unzip();
        let exits = Arc::new(exits);
        let comms = (0..self.size())
            .map(|rank| ThreadComm {
                rank,
                group: Arc::clone(&group),
                locality: Arc::clone(&self.locality),
                exits: Arc::clone(&exits),
            })
            .collect();
        (comms, tokens)
    }

    /// Run `f` once per rank on its own thread and collect the results in
    /// rank order.
    ///
    /// A rank's liveness token is held for exactly as long as its closure
    /// runs, so peers blocked on a rank that returned or panicked are woken
    /// with [`Error::RankAborted`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RankPanicked`] for the first rank whose thread
    /// panicked.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let f = &f;
        let (comms, tokens) = self.communicators();
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(tokens)
                .map(|(comm, token)| {
                    scope.spawn(move || {
                        let _alive = token;
                        f(comm)
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, h)| h.join().map_err(|_| Error::RankPanicked(rank)))
                .collect()
        })
    }
}

/// Communicator handle of one thread rank.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    group: Arc<Group>,
    locality: Arc<Vec<usize>>,
    /// Disconnects when the world rank at that index has left `run`.
    exits: Arc<Vec<Receiver<()>>>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("members", &self.group.members)
            .finish()
    }
}

impl ThreadComm {
    /// World rank of the calling thread.
    pub fn world_rank(&self) -> usize {
        self.group.members[self.rank]
    }

    fn post(&self, lane: Lane, dest: usize, tag: i32, payload: Payload) -> Result<()> {
        if dest >= self.size() {
            return Err(Error::InvalidRank(dest));
        }
        self.group
            .channel(lane, dest, self.rank)
            .0
            .send(Packet { tag, payload })
            .map_err(|_| Error::Disconnected)
    }

    fn take(&self, lane: Lane, source: usize, tag: i32) -> Result<Payload> {
        if source >= self.size() {
            return Err(Error::InvalidRank(source));
        }
        let rx = &self.group.channel(lane, self.rank, source).1;
        let exit = &self.exits[self.group.members[source]];
        let packet = select! {
            recv(rx) -> msg => msg.map_err(|_| Error::Disconnected)?,
            // Everything the peer sent happened before it left.
            recv(exit) -> _gone => rx.try_recv().map_err(|_| Error::RankAborted(source))?,
        };
        if packet.tag != tag {
            return Err(Error::TagMismatch {
                source_rank: source,
                expected: tag,
                found: packet.tag,
            });
        }
        Ok(packet.payload)
    }

    fn take_words(&self, source: usize, tag: i32) -> Result<Vec<u64>> {
        match self.take(Lane::Collective, source, tag)? {
            Payload::Words(w) => Ok(w),
            _ => Err(Error::TagMismatch {
                source_rank: source,
                expected: tag,
                found: tag,
            }),
        }
    }

    fn take_group(&self, source: usize) -> Result<Option<Arc<Group>>> {
        match self.take(Lane::Collective, source, TAG_SPLIT)? {
            Payload::Group(g) => Ok(g),
            _ => Err(Error::TagMismatch {
                source_rank: source,
                expected: TAG_SPLIT,
                found: TAG_SPLIT,
            }),
        }
    }

    fn adopt(&self, group: Option<Arc<Group>>) -> Option<ThreadComm> {
        let me = self.world_rank();
        group.and_then(|group| {
            let rank = group.members.iter().position(|&w| w == me)?;
            Some(ThreadComm {
                rank,
                group,
                locality: Arc::clone(&self.locality),
                exits: Arc::clone(&self.exits),
            })
        })
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.members.len()
    }

    fn split(&self, color: Color, key: usize) -> Result<Option<Self>> {
        let encoded = color.value().map_or(u64::MAX, |c| c as u64);
        if self.rank != 0 {
            self.post(
                Lane::Collective,
                0,
                TAG_SPLIT,
                Payload::Words(vec![encoded, key as u64]),
            )?;
            let group = self.take_group(0)?;
            return Ok(self.adopt(group));
        }

        // Root gathers (color, key) from everyone and builds the groups.
        let mut entries = vec![(encoded, key as u64)];
        for source in 1..self.size() {
            let w = self.take_words(source, TAG_SPLIT)?;
            entries.push((w[0], w[1]));
        }
        let mut by_color: BTreeMap<u64, Vec<(u64, usize)>> = BTreeMap::new();
        for (rank, &(c, k)) in entries.iter().enumerate() {
            if c != u64::MAX {
                by_color.entry(c).or_default().push((k, rank));
            }
        }
        let mut assignment: Vec<Option<Arc<Group>>> = vec![None; self.size()];
        for mut ranks in by_color.into_values() {
            ranks.sort_unstable();
            let group = Group::new(ranks.iter().map(|&(_, r)| self.group.members[r]).collect());
            for &(_, r) in &ranks {
                assignment[r] = Some(Arc::clone(&group));
            }
        }
        let mine = assignment[0].take();
        for (dest, group) in assignment.into_iter().enumerate().skip(1) {
            self.post(Lane::Collective, dest, TAG_SPLIT, Payload::Group(group))?;
        }
        Ok(self.adopt(mine))
    }

    fn split_shared(&self) -> Result<Self> {
        let node = self.locality[self.world_rank()];
        self.split(Color::with_value(node), self.rank)?
            .ok_or(Error::InvalidRank(self.rank))
    }

    fn translate_ranks(&self, other: &Self) -> Result<Vec<Option<usize>>> {
        Ok(self
            .group
            .members
            .iter()
            .map(|w| other.group.members.iter().position(|o| o == w))
            .collect())
    }

    fn barrier(&self) -> Result<()> {
        if self.rank == 0 {
            for source in 1..self.size() {
                self.take(Lane::Collective, source, TAG_BARRIER)?;
            }
            for dest in 1..self.size() {
                self.post(Lane::Collective, dest, TAG_BARRIER, Payload::Words(Vec::new()))?;
            }
        } else {
            self.post(Lane::Collective, 0, TAG_BARRIER, Payload::Words(Vec::new()))?;
            self.take(Lane::Collective, 0, TAG_BARRIER)?;
        }
        Ok(())
    }

    fn allreduce_sum(&self, data: &mut [u64]) -> Result<()> {
        if self.rank == 0 {
            for source in 1..self.size() {
                let w = self.take_words(source, TAG_ALLREDUCE)?;
                if w.len() != data.len() {
                    return Err(Error::SizeMismatch {
                        expected: data.len(),
                        found: w.len(),
                    });
                }
                for (acc, v) in data.iter_mut().zip(w) {
                    *acc = acc.wrapping_add(v);
                }
            }
            for dest in 1..self.size() {
                self.post(
                    Lane::Collective,
                    dest,
                    TAG_ALLREDUCE,
                    Payload::Words(data.to_vec()),
                )?;
            }
        } else {
            self.post(
                Lane::Collective,
                0,
                TAG_ALLREDUCE,
                Payload::Words(data.to_vec()),
            )?;
            let w = self.take_words(0, TAG_ALLREDUCE)?;
            if w.len() != data.len() {
                return Err(Error::SizeMismatch {
                    expected: data.len(),
                    found: w.len(),
                });
            }
            data.copy_from_slice(&w);
        }
        Ok(())
    }

    fn send_bytes(&self, data: &[u8], dest: usize, tag: i32) -> Result<()> {
        self.post(Lane::PointToPoint, dest, tag, Payload::Bytes(data.to_vec()))
    }

    fn recv_bytes(&self, data: &mut [u8], source: usize, tag: i32) -> Result<()> {
        match self.take(Lane::PointToPoint, source, tag)? {
            Payload::Bytes(bytes) if bytes.len() == data.len() => {
                data.copy_from_slice(&bytes);
                Ok(())
            }
            Payload::Bytes(bytes) => Err(Error::SizeMismatch {
                expected: data.len(),
                found: bytes.len(),
            }),
            _ => Err(Error::TagMismatch {
                source_rank: source,
                expected: tag,
                found: tag,
            }),
        }
    }
}
