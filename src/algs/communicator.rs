//! Thin façade over intra-process (Rayon-style threads) or inter-process (MPI)
//! message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Point-to-point handles are **waitable** but non-blocking; the collective
//! methods (`allgather`, `all_to_all_v_bytes`, `barrier`) block until every
//! rank of the group has entered the same call. Every rank must issue the
//! same collectives in the same order: skipping one on a subset of ranks is a
//! deadlock, not an error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::algs::exchange::data_exchange::all_to_all_v_p2p;
use crate::algs::wire::{cast_slice, cast_slice_mut};
use crate::topology::process::ProcessTopology;
use crate::vec_error::{ErrorKind, VecError};

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Derive a sibling tag; wraps on overflow.
    #[inline]
    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// Tag reserved for the default point-to-point `allgather`.
pub const ALLGATHER_TAG: CommTag = CommTag::new(0xFFF0);

/// Tags for one map all-to-all: the count round and the payload round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeCommTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl ExchangeCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

impl Default for ExchangeCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0xBEEF))
    }
}

/// Non-blocking communication interface plus the three collectives the
/// vector layer needs.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of `buf.len()` bytes; the payload is returned by `wait`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn topology(&self) -> ProcessTopology {
        // backends guarantee rank < size
        ProcessTopology::new(self.rank(), self.size()).unwrap_or_default()
    }

    fn is_no_comm(&self) -> bool {
        false
    }

    /// Collective: every rank contributes `sendbuf`; `recvbuf` receives the
    /// contributions concatenated in rank order. All contributions must have
    /// the same length and `recvbuf.len() == size * sendbuf.len()`.
    fn allgather(&self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<(), VecError> {
        let n = sendbuf.len();
        let counts = vec![n; self.size()];
        let displs: Vec<usize> = (0..self.size()).map(|r| r * n).collect();
        // replicate our contribution for every destination
        let send: Vec<u8> = sendbuf.repeat(self.size());
        self.all_to_all_v_bytes(
            &send,
            &counts,
            &displs,
            recvbuf,
            &counts,
            &displs,
            ALLGATHER_TAG.as_u16(),
        )
    }

    /// Collective variable-length all-to-all over bytes.
    ///
    /// `sendcounts[r]` bytes starting at `senddispls[r]` go to rank `r`;
    /// `recvcounts[r]` bytes from rank `r` land at `recvdispls[r]`. Counts must
    /// be consistent pairwise across the group.
    #[allow(clippy::too_many_arguments)]
    fn all_to_all_v_bytes(
        &self,
        sendbuf: &[u8],
        sendcounts: &[usize],
        senddispls: &[usize],
        recvbuf: &mut [u8],
        recvcounts: &[usize],
        recvdispls: &[usize],
        tag: u16,
    ) -> Result<(), VecError> {
        all_to_all_v_p2p(
            self, sendbuf, sendcounts, senddispls, recvbuf, recvcounts, recvdispls, tag,
        )
    }

    /// Collective: returns once every rank has entered.
    fn barrier(&self) -> Result<(), VecError> {
        let mut sink = vec![0u8; self.size()];
        self.allgather(&[0u8], &mut sink)
    }

    /// Terminate every rank of the group.
    fn abort(&self, code: i32) -> ! {
        log::error!("rank {} aborting with code {code}", self.rank());
        std::process::abort()
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Collective: gather one `Pod` value from every rank, in rank order.
pub fn all_gather_value<C, T>(comm: &C, value: &T) -> Result<Vec<T>, VecError>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    let mut out = vec![T::zeroed(); comm.size()];
    comm.allgather(cast_slice(std::slice::from_ref(value)), cast_slice_mut(&mut out))?;
    Ok(out)
}

/// Reduction operators for [`all_reduce_value`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Collective: reduce one `f64` across the group. Every rank folds the
/// gathered values in rank order, so all ranks obtain bit-identical results.
pub fn all_reduce_value<C>(comm: &C, value: f64, op: ReduceOp) -> Result<f64, VecError>
where
    C: Communicator + ?Sized,
{
    let all = all_gather_value(comm, &value)?;
    Ok(match op {
        ReduceOp::Sum => all.iter().sum(),
        ReduceOp::Max => all.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// Collective: make a local validation outcome group-wide.
///
/// Every rank reports whether its `local` check passed and, if not, the
/// class of its error. A failing rank gets its own error back; every other
/// rank gets [`VecError::PeerFailed`] naming the failed ranks, classed as
/// [`ErrorKind::Protocol`] when any failure was a protocol error. Either way,
/// all ranks return an error together and no rank proceeds alone into the
/// next collective.
pub fn agree_on_outcome<C, T>(
    comm: &C,
    local: Result<T, VecError>,
    operation: &'static str,
) -> Result<T, VecError>
where
    C: Communicator + ?Sized,
{
    // 0 = ok, 1 = invalid argument, 2 = protocol
    let status: u8 = match &local {
        Ok(_) => 0,
        Err(e) if e.is_fatal() => 2,
        Err(_) => 1,
    };
    let all = all_gather_value(comm, &status)?;
    let failed_ranks: Vec<usize> = all
        .iter()
        .enumerate()
        .filter_map(|(r, &s)| (s != 0).then_some(r))
        .collect();
    match local {
        Ok(_) if !failed_ranks.is_empty() => {
            let kind = if all.contains(&2) {
                ErrorKind::Protocol
            } else {
                ErrorKind::InvalidArgument
            };
            log::debug!(
                "rank {}: {operation} failed on rank(s) {failed_ranks:?} ({kind:?})",
                comm.rank()
            );
            Err(VecError::PeerFailed {
                rank: comm.rank(),
                operation,
                failed_ranks,
                kind,
            })
        }
        other => other,
    }
}

/// Compile-time no-op comm for pure serial use and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Per-group mailbox: FIFO per `(src, dst, tag)` so per-pair order is kept.
#[derive(Debug, Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    arrived: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, data: Bytes) {
        self.slots.entry(key).or_default().push_back(data);
        let _guard = self.lock.lock();
        self.arrived.notify_all();
    }

    fn try_take(&self, key: &Key) -> Option<Bytes> {
        self.slots.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn take_blocking(&self, key: &Key) -> Bytes {
        loop {
            if let Some(data) = self.try_take(key) {
                return data;
            }
            let mut guard = self.lock.lock();
            if let Some(data) = self.try_take(key) {
                return data;
            }
            self.arrived.wait_for(&mut guard, Duration::from_millis(50));
        }
    }
}

/// Receive handle for [`RayonComm`]; blocks in `wait` until the message arrives.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.mailbox.take_blocking(&self.key).to_vec())
    }
}

/// In-process rank: one per thread, all members of a group share a mailbox.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl RayonComm {
    /// Create the `size` ranks of a fresh group. Distinct groups never see
    /// each other's messages.
    pub fn group(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .post((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn abort(&self, code: i32) -> ! {
        panic!("rank {} of {} aborted with code {code}", self.rank, self.size)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::Count;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI world communicator. Owns the MPI environment: dropping the last
    /// `MpiComm` finalizes MPI.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        pub size: usize,
        _universe: Universe,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, VecError> {
            let universe = mpi::initialize().ok_or_else(|| VecError::CommError {
                neighbor: 0,
                message: "MPI initialization failed (already initialized?)".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    fn to_counts(v: &[usize]) -> Result<Vec<Count>, VecError> {
        v.iter()
            .map(|&n| {
                Count::try_from(n).map_err(|_| VecError::CommError {
                    neighbor: 0,
                    message: format!("count {n} exceeds MPI count range"),
                })
            })
            .collect()
    }

    /// Non-blocking request over a heap buffer leaked for the request's
    /// lifetime and reclaimed in `wait`.
    pub struct MpiHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
        is_recv: bool,
    }

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: `buf` came from `Box::leak` in isend/irecv and the
            // request that borrowed it has completed.
            let owned = unsafe { Box::from_raw(self.buf) };
            self.is_recv.then(|| owned.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            // SAFETY: the buffer stays alive until `MpiHandle::wait` reclaims it.
            let data: &'static [u8] = unsafe { &*ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                req,
                buf: ptr,
                is_recv: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let leaked: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            // SAFETY: as in `isend`.
            let data: &'static mut [u8] = unsafe { &mut *ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                req,
                buf: ptr,
                is_recv: true,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn allgather(&self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<(), VecError> {
            crate::algs::wire::expect_exact_len(recvbuf.len(), sendbuf.len() * self.size)?;
            self.world.all_gather_into(sendbuf, recvbuf);
            Ok(())
        }

        fn all_to_all_v_bytes(
            &self,
            sendbuf: &[u8],
            sendcounts: &[usize],
            senddispls: &[usize],
            recvbuf: &mut [u8],
            recvcounts: &[usize],
            recvdispls: &[usize],
            _tag: u16,
        ) -> Result<(), VecError> {
            let sc = to_counts(sendcounts)?;
            let sd = to_counts(senddispls)?;
            let rc = to_counts(recvcounts)?;
            let rd = to_counts(recvdispls)?;
            let send = Partition::new(sendbuf, &sc[..], &sd[..]);
            let mut recv = PartitionMut::new(recvbuf, &rc[..], &rd[..]);
            self.world.all_to_all_varcount_into(&send, &mut recv);
            Ok(())
        }

        fn barrier(&self) -> Result<(), VecError> {
            self.world.barrier();
            Ok(())
        }

        fn abort(&self, code: i32) -> ! {
            self.world.abort(code)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
