//! Process-group context for distributed components.
//!
//! Every distributed structure ([`crate::civec::DistCivec`], [`crate::smith::tensor::Tensor`],
//! [`crate::smith::queue::Queue`]) receives a shared [`Communicator`] handle explicitly. Drivers
//! obtain their default handle from [`world`], which is backed by MPI when the `mpi` feature is
//! enabled and the MPI environment has been initialised.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Barrier, Mutex};

use anyhow::{self, ensure, format_err};

#[cfg(test)]
#[path = "parallel_tests.rs"]
mod parallel_tests;

// =================
// Trait definitions
// =================

/// Trait for collective communication among a fixed group of worker ranks.
///
/// All collective methods must be called by every rank of the group in the same order.
pub trait Communicator: Send + Sync + fmt::Debug {
    /// The rank of the calling worker.
    fn rank(&self) -> usize;

    /// The number of workers in the group.
    fn size(&self) -> usize;

    /// Blocks until every rank has reached this point.
    fn barrier(&self);

    /// Sums `buffer` elementwise over all ranks. On return, every rank holds the total.
    fn allreduce_sum(&self, buffer: &mut [f64]) -> Result<(), anyhow::Error>;

    /// Personalised all-to-all exchange: `send[r]` goes to rank `r`, and element `r` of the
    /// result is what rank `r` sent to the caller.
    fn all_to_all_f64(&self, send: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, anyhow::Error>;

    /// As [`Communicator::all_to_all_f64`], for index messages.
    fn all_to_all_u64(&self, send: &[Vec<u64>]) -> Result<Vec<Vec<u64>>, anyhow::Error>;

    /// Returns `true` if the calling worker is the root rank.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Shared handle to a communicator.
pub type CommHandle = Arc<dyn Communicator>;

/// The communicator spanning every process of the run.
///
/// With the `mpi` feature this is `MPI_COMM_WORLD` once the MPI environment is up; otherwise, or
/// before initialisation, a [`SerialCommunicator`].
pub fn world() -> CommHandle {
    #[cfg(feature = "mpi")]
    if mpi::environment::is_initialized() && !mpi::environment::is_finalized() {
        return Arc::new(MpiCommunicator::world());
    }
    SerialCommunicator::handle()
}

fn check_send_len<T>(send: &[Vec<T>], size: usize) -> Result<(), anyhow::Error> {
    ensure!(
        send.len() == size,
        "All-to-all send buffers cover {} ranks but the group has {size}.",
        send.len()
    );
    Ok(())
}

// ==================
// Struct definitions
// ==================

// ------
// Serial
// ------

/// Single-rank communicator. All collectives are no-ops.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialCommunicator;

impl SerialCommunicator {
    /// Returns a shared handle to a serial communicator.
    pub fn handle() -> CommHandle {
        Arc::new(SerialCommunicator)
    }
}

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn allreduce_sum(&self, _buffer: &mut [f64]) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn all_to_all_f64(&self, send: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, anyhow::Error> {
        check_send_len(send, 1)?;
        Ok(send.to_vec())
    }

    fn all_to_all_u64(&self, send: &[Vec<u64>]) -> Result<Vec<Vec<u64>>, anyhow::Error> {
        check_send_len(send, 1)?;
        Ok(send.to_vec())
    }
}

// -------
// Threads
// -------

/// Per-pair message slots, indexed `[from][to]`.
type Mailbox<T> = Mutex<Vec<Vec<Vec<T>>>>;

#[derive(Debug)]
struct ThreadGroupShared {
    barrier: Barrier,
    reduction: Mutex<Vec<f64>>,
    values: Mailbox<f64>,
    indices: Mailbox<u64>,
}

/// In-process communicator whose ranks are threads sharing one reduction buffer.
///
/// Construct a whole group with [`ThreadCommunicator::group`] and move one member into each
/// worker thread.
#[derive(Clone, Debug)]
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<ThreadGroupShared>,
}

impl ThreadCommunicator {
    /// Creates the handles of a group of `size` thread ranks.
    pub fn group(size: usize) -> Result<Vec<CommHandle>, anyhow::Error> {
        ensure!(size > 0, "A thread communicator group needs at least one rank.");
        let shared = Arc::new(ThreadGroupShared {
            barrier: Barrier::new(size),
            reduction: Mutex::new(Vec::new()),
            values: Mutex::new(vec![vec![Vec::new(); size]; size]),
            indices: Mutex::new(vec![vec![Vec::new(); size]; size]),
        });
        Ok((0..size)
            .map(|rank| {
                Arc::new(ThreadCommunicator {
                    rank,
                    size,
                    shared: shared.clone(),
                }) as CommHandle
            })
            .collect())
    }

    fn exchange<T: Clone>(
        &self,
        mailbox: &Mailbox<T>,
        send: &[Vec<T>],
    ) -> Result<Vec<Vec<T>>, anyhow::Error> {
        check_send_len(send, self.size)?;
        // Slots are emptied by their receiver; the entry barrier keeps a fast rank from
        // overwriting a slot that is still being read from the previous exchange.
        self.shared.barrier.wait();
        {
            let mut slots = mailbox
                .lock()
                .map_err(|_| format_err!("Mailbox lock poisoned."))?;
            slots[self.rank].clone_from_slice(send);
        }
        self.shared.barrier.wait();
        let mut slots = mailbox
            .lock()
            .map_err(|_| format_err!("Mailbox lock poisoned."))?;
        Ok((0..self.size)
            .map(|from| std::mem::take(&mut slots[from][self.rank]))
            .collect())
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn allreduce_sum(&self, buffer: &mut [f64]) -> Result<(), anyhow::Error> {
        // The reduction buffer is empty on entry; rank 0 empties it again after everyone has
        // copied the total out. The entry barrier of the next call orders that reset.
        self.shared.barrier.wait();
        {
            let mut total = self
                .shared
                .reduction
                .lock()
                .map_err(|_| format_err!("Reduction buffer lock poisoned."))?;
            if total.is_empty() {
                total.resize(buffer.len(), 0.0);
            }
            ensure!(
                total.len() == buffer.len(),
                "Mismatched all-reduce lengths across ranks: {} vs {}.",
                total.len(),
                buffer.len()
            );
            total
                .iter_mut()
                .zip(buffer.iter())
                .for_each(|(t, b)| *t += b);
        }
        self.shared.barrier.wait();
        {
            let total = self
                .shared
                .reduction
                .lock()
                .map_err(|_| format_err!("Reduction buffer lock poisoned."))?;
            buffer.copy_from_slice(&total);
        }
        self.shared.barrier.wait();
        if self.rank == 0 {
            self.shared
                .reduction
                .lock()
                .map_err(|_| format_err!("Reduction buffer lock poisoned."))?
                .clear();
        }
        Ok(())
    }

    fn all_to_all_f64(&self, send: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, anyhow::Error> {
        self.exchange(&self.shared.values, send)
    }

    fn all_to_all_u64(&self, send: &[Vec<u64>]) -> Result<Vec<Vec<u64>>, anyhow::Error> {
        self.exchange(&self.shared.indices, send)
    }
}

// ---
// MPI
// ---

/// Communicator over the ranks of an MPI job.
///
/// The MPI environment must be initialised (and kept alive) by the caller, typically by holding
/// the [`mpi::environment::Universe`] in `main`.
#[cfg(feature = "mpi")]
pub struct MpiCommunicator {
    world: mpi::topology::SimpleCommunicator,
}

// MPI communicator handles are process-local identifiers. Collectives are only issued by the
// thread driving a calculation, one at a time.
#[cfg(feature = "mpi")]
unsafe impl Send for MpiCommunicator {}
#[cfg(feature = "mpi")]
unsafe impl Sync for MpiCommunicator {}

#[cfg(feature = "mpi")]
impl MpiCommunicator {
    /// Wraps `MPI_COMM_WORLD`.
    pub fn world() -> Self {
        Self {
            world: mpi::topology::SimpleCommunicator::world(),
        }
    }

    fn exchange<T>(&self, send: &[Vec<T>]) -> Result<Vec<Vec<T>>, anyhow::Error>
    where
        T: mpi::datatype::Equivalence + Clone + Default,
    {
        use mpi::datatype::{Partition, PartitionMut};
        use mpi::traits::CommunicatorCollectives;

        let nranks = self.size();
        check_send_len(send, nranks)?;
        let send_counts = send.iter().map(|m| m.len() as i32).collect::<Vec<_>>();
        let send_displacements = send_counts
            .iter()
            .scan(0i32, |acc, &c| {
                let start = *acc;
                *acc += c;
                Some(start)
            })
            .collect::<Vec<_>>();
        let send_contig = send.concat();

        let mut recv_counts = vec![0i32; nranks];
        self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);
        let recv_displacements = recv_counts
            .iter()
            .scan(0i32, |acc, &c| {
                let start = *acc;
                *acc += c;
                Some(start)
            })
            .collect::<Vec<_>>();
        let total_recv = recv_counts.iter().map(|&c| c as usize).sum::<usize>();
        let mut recv_contig = vec![T::default(); total_recv];
        {
            let send_part = Partition::new(&send_contig[..], &send_counts[..], &send_displacements[..]);
            let mut recv_part = PartitionMut::new(
                &mut recv_contig[..],
                &recv_counts[..],
                &recv_displacements[..],
            );
            self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
        }
        Ok(recv_counts
            .iter()
            .zip(recv_displacements.iter())
            .map(|(&c, &d)| recv_contig[d as usize..(d + c) as usize].to_vec())
            .collect())
    }
}

#[cfg(feature = "mpi")]
impl fmt::Debug for MpiCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiCommunicator")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(feature = "mpi")]
impl Communicator for MpiCommunicator {
    fn rank(&self) -> usize {
        use mpi::traits::Communicator as _;
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        use mpi::traits::Communicator as _;
        self.world.size() as usize
    }

    fn barrier(&self) {
        use mpi::traits::CommunicatorCollectives;
        self.world.barrier();
    }

    fn allreduce_sum(&self, buffer: &mut [f64]) -> Result<(), anyhow::Error> {
        use mpi::collective::SystemOperation;
        use mpi::traits::CommunicatorCollectives;

        let send = buffer.to_vec();
        self.world
            .all_reduce_into(&send[..], buffer, SystemOperation::sum());
        Ok(())
    }

    fn all_to_all_f64(&self, send: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, anyhow::Error> {
        self.exchange(send)
    }

    fn all_to_all_u64(&self, send: &[Vec<u64>]) -> Result<Vec<Vec<u64>>, anyhow::Error> {
        self.exchange(send)
    }
}

// ------------
// Distribution
// ------------

/// Contiguous distribution of `n` items over the ranks of a group. The first `n % size` ranks
/// receive one extra item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticDist {
    n: usize,
    size: usize,
}

impl StaticDist {
    /// Creates the distribution of `n` items over `size` ranks.
    pub fn new(n: usize, size: usize) -> Self {
        Self {
            n,
            size: size.max(1),
        }
    }

    /// The half-open range of items owned by `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        let base = self.n / self.size;
        let extra = self.n % self.size;
        let start = rank * base + rank.min(extra);
        let len = base + usize::from(rank < extra);
        start..(start + len).min(self.n)
    }

    /// The rank owning item `i`.
    pub fn owner(&self, i: usize) -> usize {
        (0..self.size)
            .find(|&rank| self.range(rank).contains(&i))
            .unwrap_or(self.size - 1)
    }

    /// The total number of items.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Returns `true` if there are no items.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}
