//! Communication algorithms: the transport façade, the all-to-all exchange,
//! the ghost plan builder and the deferred assembly protocol.

pub mod assembly;
pub mod communicator;
pub mod exchange;
pub mod ghost_plan;
pub mod wire;

pub use assembly::{AssemblyCommTags, assemble_values};
pub use exchange::{all_to_all_v, map_all_to_all};
pub use ghost_plan::GhostCommPlan;
