//! Capability trait shared by both vector flavours.
//!
//! Solver code written against [`DistributedVector`] works with plain and
//! ghosted vectors alike: local access, ghost refresh and deferred assembly.
//! For a vector without ghosts the refresh is a no-op that issues no
//! communication.

use crate::algs::communicator::Communicator;
use crate::data::ghosted_vector::GhostedParallelVector;
use crate::data::parallel_vector::ParallelVector;
use crate::topology::extents::OwnershipExtents;
use crate::vec_error::VecError;

pub trait DistributedVector {
    fn extents(&self) -> &OwnershipExtents;
    fn local_values(&self) -> &[f64];
    fn local_values_mut(&mut self) -> &mut [f64];

    fn local_size(&self) -> usize {
        self.local_values().len()
    }

    fn global_size(&self) -> u64 {
        self.extents().global_size()
    }

    /// Collective (for ghosted vectors): refresh the ghost region.
    fn update_ghosts<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError>;

    fn queue_set(&mut self, global_id: u64, value: f64) -> Result<(), VecError>;
    fn queue_add(&mut self, global_id: u64, value: f64) -> Result<(), VecError>;

    /// Collective: apply queued operations on their owners.
    fn assemble_queued<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError>;
}

impl DistributedVector for ParallelVector {
    fn extents(&self) -> &OwnershipExtents {
        ParallelVector::extents(self)
    }
    fn local_values(&self) -> &[f64] {
        ParallelVector::local_values(self)
    }
    fn local_values_mut(&mut self) -> &mut [f64] {
        ParallelVector::local_values_mut(self)
    }

    fn update_ghosts<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        self.check_comm(comm)
    }

    fn queue_set(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.set_value(global_id, value)
    }
    fn queue_add(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.add_value(global_id, value)
    }

    fn assemble_queued<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        self.assemble(comm)
    }
}

impl DistributedVector for GhostedParallelVector {
    fn extents(&self) -> &OwnershipExtents {
        self.as_vector().extents()
    }
    fn local_values(&self) -> &[f64] {
        self.as_vector().local_values()
    }
    fn local_values_mut(&mut self) -> &mut [f64] {
        ParallelVector::local_values_mut(self)
    }

    fn update_ghosts<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        self.communicate_ghost_entries(comm)
    }

    fn queue_set(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.set_value(global_id, value)
    }
    fn queue_add(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.add_value(global_id, value)
    }

    fn assemble_queued<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        self.assemble(comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn bump_first<V: DistributedVector>(v: &mut V) {
        v.queue_add(0, 1.0).unwrap();
        v.assemble_queued(&NoComm).unwrap();
        v.update_ghosts(&NoComm).unwrap();
    }

    #[test]
    fn both_flavours_share_the_interface() {
        let mut plain = ParallelVector::new(&NoComm, 2, 2).unwrap();
        let mut ghosted = GhostedParallelVector::new(&NoComm, 2, 2, vec![]).unwrap();
        bump_first(&mut plain);
        bump_first(&mut ghosted);
        assert_eq!(DistributedVector::local_values(&plain), &[1.0, 0.0]);
        assert_eq!(DistributedVector::local_values(&ghosted), &[1.0, 0.0]);
        assert_eq!(DistributedVector::global_size(&ghosted), 2);
    }
}
