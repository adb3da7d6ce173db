//! A [`ParallelVector`] with a ghost region and the communicator that fills it.
//!
//! The buffer is `owned ++ ghosts`; ghosts appear in the order their ids were
//! supplied. Ghost slots are read-only: they change only through
//! [`GhostedParallelVector::communicate_ghost_entries`], never through
//! assembly or indexed writes.

use std::ops::{Deref, DerefMut};

use crate::algs::communicator::Communicator;
use crate::data::ghost_communicator::VectorGhostCommunicator;
use crate::data::parallel_vector::{ParallelVector, VectorCommTags};
use crate::vec_error::VecError;

#[derive(Clone, Debug)]
pub struct GhostedParallelVector {
    vector: ParallelVector,
    ghosts: VectorGhostCommunicator,
}

impl GhostedParallelVector {
    /// Collective: zeroed vector with `local_size` owned entries and a ghost
    /// slot for every id in `ghost_ids`.
    pub fn new<C: Communicator>(
        comm: &C,
        local_size: usize,
        global_size: u64,
        ghost_ids: Vec<u64>,
    ) -> Result<Self, VecError> {
        Self::with_tags(comm, local_size, global_size, ghost_ids, VectorCommTags::default())
    }

    pub fn with_tags<C: Communicator>(
        comm: &C,
        local_size: usize,
        global_size: u64,
        ghost_ids: Vec<u64>,
        tags: VectorCommTags,
    ) -> Result<Self, VecError> {
        let ghosts =
            VectorGhostCommunicator::with_tags(comm, local_size, global_size, ghost_ids, tags.ghost)?;
        Ok(Self::from_ghost_communicator(ghosts, tags))
    }

    /// Zeroed vector sharing an already built exchange plan. Not collective.
    pub fn from_ghost_communicator(ghosts: VectorGhostCommunicator, tags: VectorCommTags) -> Self {
        let vector = ParallelVector::with_ghost_region(
            ghosts.topology(),
            ghosts.extents().clone(),
            tags,
            ghosts.num_ghosts(),
        );
        Self { vector, ghosts }
    }

    #[inline]
    pub fn ghost_communicator(&self) -> &VectorGhostCommunicator {
        &self.ghosts
    }

    #[inline]
    pub fn as_vector(&self) -> &ParallelVector {
        &self.vector
    }

    #[inline]
    pub fn ghost_ids(&self) -> &[u64] {
        self.ghosts.ghost_ids()
    }

    #[inline]
    pub fn num_ghosts(&self) -> usize {
        self.ghosts.num_ghosts()
    }

    pub fn ghost_values(&self) -> &[f64] {
        &self.vector.buffer()[self.vector.local_size()..]
    }

    /// Owned entries followed by the ghost region.
    pub fn ghosted_values(&self) -> &[f64] {
        self.vector.buffer()
    }

    #[inline]
    pub fn map_ghost_to_local(&self, ghost_id: u64) -> Result<usize, VecError> {
        self.ghosts.map_ghost_to_local(ghost_id)
    }

    /// Read an owned or ghosted entry by global id.
    pub fn get_global_value(&self, global_id: u64) -> Result<f64, VecError> {
        let owned = self.vector.owned_range();
        let index = if owned.contains(&global_id) {
            (global_id - owned.start) as usize
        } else if global_id >= self.vector.global_size() {
            return Err(VecError::InvalidGlobalId {
                id: global_id,
                global_size: self.vector.global_size(),
            });
        } else {
            self.ghosts.map_ghost_to_local(global_id)?
        };
        Ok(self.vector.buffer()[index])
    }

    /// Collective: refresh every ghost slot from its owner.
    pub fn communicate_ghost_entries<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        self.vector.check_comm(comm)?;
        self.ghosts
            .communicate_ghost_entries(comm, self.vector.buffer_mut())
    }

    /// Same layout, plan and values (ghosts included); no pending operations.
    pub fn make_copy(&self) -> Self {
        Self {
            vector: self.vector.make_copy(),
            ghosts: self.ghosts.clone(),
        }
    }

    /// Same layout and plan, zeroed.
    pub fn make_clone(&self) -> Self {
        Self {
            vector: self.vector.make_clone(),
            ghosts: self.ghosts.clone(),
        }
    }
}

impl Deref for GhostedParallelVector {
    type Target = ParallelVector;

    fn deref(&self) -> &ParallelVector {
        &self.vector
    }
}

impl DerefMut for GhostedParallelVector {
    fn deref_mut(&mut self) -> &mut ParallelVector {
        &mut self.vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_vector_has_empty_ghost_region() {
        let mut v = GhostedParallelVector::new(&NoComm, 2, 2, vec![]).unwrap();
        v.set_local_values(&[1.0, 2.0]).unwrap();
        v.communicate_ghost_entries(&NoComm).unwrap();
        assert!(v.ghost_values().is_empty());
        assert_eq!(v.get_global_value(1).unwrap(), 2.0);
        assert!(v.get_global_value(2).is_err());
    }

    #[test]
    fn assemble_leaves_ghosts_alone() {
        // extents [0,1,2]; each rank ghosts the other's single entry
        let comms = RayonComm::group(2);
        let got: Vec<(Vec<f64>, f64)> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let me = c.rank() as u64;
                        let mut v = GhostedParallelVector::new(c, 1, 2, vec![1 - me]).unwrap();
                        v[0] = 10.0 * (me + 1) as f64;
                        v.communicate_ghost_entries(c).unwrap();
                        v.add_value(1 - me, 1.0).unwrap();
                        v.assemble(c).unwrap();
                        let ghost = v.get_global_value(1 - me).unwrap();
                        (v.ghosted_values().to_vec(), ghost)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // owned entries got the peer's add; ghosts still hold the pre-assembly value
        assert_eq!(got[0], (vec![11.0, 20.0], 20.0));
        assert_eq!(got[1], (vec![21.0, 10.0], 10.0));
    }

    #[test]
    fn unknown_remote_id_is_rejected() {
        let comms = RayonComm::group(2);
        std::thread::scope(|s| {
            for c in &comms {
                s.spawn(move || {
                    // extents [0,2,4]; rank 0 ghosts only 3
                    let ghosts = if c.rank() == 0 { vec![3] } else { vec![] };
                    let v = GhostedParallelVector::new(c, 2, 4, ghosts).unwrap();
                    if c.rank() == 0 {
                        assert_eq!(v.map_ghost_to_local(3).unwrap(), 2);
                        assert_eq!(v.get_global_value(2), Err(VecError::UnknownGhostId(2)));
                    }
                });
            }
        });
    }
}
