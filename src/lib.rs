//! # ghost-vec
//!
//! ghost-vec partitions a logically global `f64` vector across a fixed group
//! of ranks. Each rank owns a contiguous range of global ids, can read
//! remotely owned entries through a reusable ghost-exchange plan, and can
//! queue writes to any id that are resolved on the owners by a collective
//! assembly step.
//!
//! ## Collectives
//! Every operation that takes a `comm` argument (construction, ghost
//! exchange, assembly, norms) is a blocking collective: all ranks of the group
//! must call it, in the same order. Skipping one on a subset of ranks
//! deadlocks. Argument checks run before any communication; cross-rank
//! violations (mixed set/add modes, disagreeing extents, foreign ids on the
//! wire) are reported as fatal errors on every rank, see
//! [`vec_error::OrAbort`].
//!
//! ## Backends
//! - [`NoComm`](algs::communicator::NoComm): serial, single rank.
//! - [`RayonComm`](algs::communicator::RayonComm): in-process ranks on
//!   threads, one group per `RayonComm::group(n)`.
//! - `MpiComm` (feature `mpi-support`): MPI world communicator.
//!
//! ## Features
//! - `mpi-support`: MPI backend.
//! - `rayon`: data-parallel local kernels (axpy, scale, norms).
//! - `check-invariants` / `strict-invariants`: invariant checks in release
//!   builds.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod topology;
pub mod vec_error;

pub use debug_invariants::DebugInvariants;
pub use vec_error::{ErrorKind, OrAbort, VecError};

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{
        CommTag, Communicator, ExchangeCommTags, NoComm, RayonComm, Wait,
    };
    pub use crate::algs::ghost_plan::GhostCommPlan;
    pub use crate::data::{
        CacheMode, DistributedVector, GhostedParallelVector, NormType, ParallelVector,
        VecOpType, VectorCommTags, VectorGhostCommunicator,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::topology::{OwnershipExtents, ProcessTopology};
    pub use crate::vec_error::{OrAbort, VecError};
}
