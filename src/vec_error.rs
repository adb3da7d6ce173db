//! VecError: unified error type for ghost-vec public APIs.
//!
//! Errors fall into two classes (see [`ErrorKind`]):
//!
//! - **Invalid argument**: the caller passed something locally detectable as
//!   wrong (out-of-range id, mismatched buffer length). These are raised
//!   before any collective call is issued, so they cannot desynchronize the
//!   process group and the caller may handle them.
//! - **Protocol**: an invariant that spans ranks was violated (mixed set/add
//!   modes, disagreeing extents, foreign ids on the wire). These are fatal:
//!   continuing on one rank while peers proceed under the old assumption
//!   reintroduces the divergence the check caught. Use [`OrAbort`] to take the
//!   whole job down with a diagnostic.

use thiserror::Error;

use crate::algs::communicator::Communicator;
use crate::data::op_cache::CacheMode;
use crate::topology::process::ProcessTopology;

/// Coarse classification of a [`VecError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller mistake, detected before communication. Recoverable.
    InvalidArgument,
    /// Cross-rank invariant violation. Fatal for the whole job.
    Protocol,
}

/// Unified error type for ghost-vec operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VecError {
    /// A global id fell outside `[0, global_size)`.
    #[error("invalid global id {id}: global ids must be in [0, {global_size})")]
    InvalidGlobalId { id: u64, global_size: u64 },
    /// A local index fell outside the local buffer.
    #[error("invalid local index {index}: expected [0, {len})")]
    InvalidLocalId { index: usize, len: usize },
    /// A buffer or argument list had the wrong length.
    #[error("{what}: expected length {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A block copy/set range ran past the end of a buffer.
    #[error("{what}: range {offset}..{end} out of bounds for length {len}")]
    RangeOutOfBounds {
        what: &'static str,
        offset: usize,
        end: usize,
        len: usize,
    },
    /// A rank index was not a member of the process group.
    #[error("rank {rank} is not in a process group of size {size}")]
    InvalidRank { rank: usize, size: usize },
    /// The communicator passed to a collective does not match the topology
    /// the object was built with.
    #[error("communicator mismatch: built for {expected:?}, called with {got:?}")]
    CommunicatorMismatch {
        expected: ProcessTopology,
        got: ProcessTopology,
    },
    /// The declared global size disagrees with the sum of local sizes.
    #[error("global size mismatch: declared {declared}, local sizes sum to {computed}")]
    GlobalSizeMismatch { declared: u64, computed: u64 },
    /// Two vectors with different layouts were combined.
    #[error("incompatible vector layouts: local {lhs_local} vs {rhs_local}, global {lhs_global} vs {rhs_global}")]
    IncompatibleLayout {
        lhs_local: usize,
        rhs_local: usize,
        lhs_global: u64,
        rhs_global: u64,
    },
    /// Extents do not form a valid non-decreasing partition starting at zero.
    #[error("invalid ownership extents: {0}")]
    InvalidExtents(String),
    /// Summing local sizes overflowed the global index type.
    #[error("global size overflow while summing local sizes")]
    SizeOverflow,
    /// A requested ghost id is owned by the requesting rank.
    #[error("ghost id {id} is locally owned by rank {rank}")]
    GhostIdLocallyOwned { id: u64, rank: usize },
    /// The same ghost id was requested more than once.
    #[error("ghost id {0} appears more than once in the ghost index set")]
    DuplicateGhostId(u64),
    /// A ghost id lookup named an id that is not in the ghost index set.
    #[error("ghost id {0} does not belong to this communicator")]
    UnknownGhostId(u64),

    /// A collective step failed on other ranks of the group.
    ///
    /// `kind` is the worst class among the failed ranks' errors, so a
    /// protocol violation detected by one rank is fatal on all of them.
    #[error("rank {rank}: {operation} failed on rank(s) {failed_ranks:?}")]
    PeerFailed {
        rank: usize,
        operation: &'static str,
        failed_ranks: Vec<usize>,
        kind: ErrorKind,
    },

    /// Set and add operations were queued on the same rank.
    #[error("rank {rank}: cannot queue a {attempted:?} operation while {pending} {pending_mode:?} operation(s) are pending")]
    MixedOperationModes {
        rank: usize,
        attempted: CacheMode,
        pending_mode: CacheMode,
        pending: usize,
    },
    /// Ranks disagreed on the operation mode at assembly time.
    #[error("rank {rank}: assembly mode mismatch, local {local_mode:?} vs global {global_mode:?}; offending ranks {offenders:?}")]
    ModeMismatch {
        rank: usize,
        local_mode: CacheMode,
        global_mode: CacheMode,
        offenders: Vec<(usize, CacheMode)>,
    },
    /// A peer asked this rank for a ghost value it does not own.
    #[error("rank {rank}: rank {requester} requested global id {id}, which is not locally owned ({start}..{end})")]
    ForeignGhostRequest {
        rank: usize,
        requester: usize,
        id: u64,
        start: u64,
        end: u64,
    },
    /// A peer sent an assembly record for an id this rank does not own.
    #[error("rank {rank}: rank {source_rank} sent an assembly operation for global id {id}, which is not locally owned ({start}..{end})")]
    ForeignAssemblyTarget {
        rank: usize,
        source_rank: usize,
        id: u64,
        start: u64,
        end: u64,
    },
    /// A received byte buffer was not a whole number of records.
    #[error("rank {rank}: received {len} bytes from rank {source_rank}, not a multiple of the {record_size}-byte record size")]
    MalformedRecords {
        rank: usize,
        source_rank: usize,
        len: usize,
        record_size: usize,
    },
    /// A message did not have the size both sides agreed on.
    #[error("buffer size mismatch with rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Transport-level failure talking to a peer.
    #[error("communication error with rank {neighbor}: {message}")]
    CommError { neighbor: usize, message: String },
}

impl VecError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        use VecError::*;
        match self {
            MixedOperationModes { .. }
            | ModeMismatch { .. }
            | ForeignGhostRequest { .. }
            | ForeignAssemblyTarget { .. }
            | MalformedRecords { .. }
            | BufferSizeMismatch { .. }
            | CommError { .. } => ErrorKind::Protocol,
            PeerFailed { kind, .. } => *kind,
            _ => ErrorKind::InvalidArgument,
        }
    }

    /// True when the error must terminate the whole job.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

/// Escalate fatal errors to a group-wide abort.
///
/// Invalid-argument errors are returned unchanged so the caller can still
/// handle them; protocol errors are logged with rank and operation context and
/// then abort every rank through [`Communicator::abort`]. A partial abort would
/// leave surviving ranks blocked in their next collective call.
pub trait OrAbort<T> {
    fn or_abort<C: Communicator>(self, comm: &C, operation: &str) -> Result<T, VecError>;
}

impl<T> OrAbort<T> for Result<T, VecError> {
    fn or_abort<C: Communicator>(self, comm: &C, operation: &str) -> Result<T, VecError> {
        match self {
            Err(e) if e.is_fatal() => {
                log::error!(
                    "rank {} of {}: fatal error in {operation}: {e}",
                    comm.rank(),
                    comm.size()
                );
                comm.abort(1)
            }
            other => other,
        }
    }
}
