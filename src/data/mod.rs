//! Distributed vector storage: deferred-operation cache, ghost exchange and
//! the two vector flavours.

pub mod distributed;
pub mod ghost_communicator;
pub mod ghosted_vector;
pub mod op_cache;
pub mod parallel_vector;

pub use distributed::DistributedVector;
pub use ghost_communicator::{GhostCommTags, VectorGhostCommunicator};
pub use ghosted_vector::GhostedParallelVector;
pub use op_cache::{CacheMode, OpCache, VecOpType};
pub use parallel_vector::{NormType, ParallelVector, VectorCommTags};
