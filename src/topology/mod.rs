//! Process group identity and global index ownership.

pub mod extents;
pub mod process;

pub use extents::OwnershipExtents;
pub use process::ProcessTopology;
