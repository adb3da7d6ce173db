//! Ghost exchange: refresh a rank's read-only copies of remotely owned values.
//!
//! A [`VectorGhostCommunicator`] is built once per `(extents, ghost ids)` and
//! then reused for any number of exchanges. The ghost region of a buffer is
//! laid out in the order the ghost ids were supplied at construction; the
//! plan's receive layout (owner-rank ascending) is mapped onto that order
//! when values are scattered.
//!
//! Every method taking a `comm` is collective.

use bytemuck::Pod;
use hashbrown::HashMap;

use crate::algs::communicator::{CommTag, Communicator, ExchangeCommTags, agree_on_outcome};
use crate::algs::exchange::all_to_all_v;
use crate::algs::ghost_plan::GhostCommPlan;
use crate::topology::extents::OwnershipExtents;
use crate::topology::process::ProcessTopology;
use crate::vec_error::VecError;

/// Tags used by the plan build and by every ghost exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GhostCommTags {
    pub plan: ExchangeCommTags,
    pub values: CommTag,
}

impl GhostCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            plan: ExchangeCommTags::from_base(base),
            values: base.offset(2),
        }
    }
}

impl Default for GhostCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x6A00))
    }
}

#[derive(Clone, Debug)]
pub struct VectorGhostCommunicator {
    topology: ProcessTopology,
    extents: OwnershipExtents,
    ghost_ids: Vec<u64>,
    /// ghost id -> index into `ghost_ids`
    ghost_positions: HashMap<u64, usize>,
    /// receive-buffer position for each ghost slot
    scatter: Vec<usize>,
    plan: GhostCommPlan,
    tags: GhostCommTags,
}

impl VectorGhostCommunicator {
    /// Collective: build extents from `local_size`, then the plan for
    /// `ghost_ids`.
    pub fn new<C: Communicator>(
        comm: &C,
        local_size: usize,
        global_size: u64,
        ghost_ids: Vec<u64>,
    ) -> Result<Self, VecError> {
        Self::with_tags(comm, local_size, global_size, ghost_ids, GhostCommTags::default())
    }

    pub fn with_tags<C: Communicator>(
        comm: &C,
        local_size: usize,
        global_size: u64,
        ghost_ids: Vec<u64>,
        tags: GhostCommTags,
    ) -> Result<Self, VecError> {
        let extents = OwnershipExtents::build(comm, local_size as u64)?;
        let declared = if extents.global_size() == global_size {
            Ok(())
        } else {
            Err(VecError::GlobalSizeMismatch {
                declared: global_size,
                computed: extents.global_size(),
            })
        };
        agree_on_outcome(comm, declared, "ghost communicator construction")?;
        Self::from_extents(comm, extents, ghost_ids, tags)
    }

    /// Collective: build the plan over already agreed extents.
    ///
    /// Ghost ids are validated on every rank first and the outcome is shared,
    /// so a bad id on one rank fails construction on all of them.
    pub fn from_extents<C: Communicator>(
        comm: &C,
        extents: OwnershipExtents,
        ghost_ids: Vec<u64>,
        tags: GhostCommTags,
    ) -> Result<Self, VecError> {
        let topology = comm.topology();
        let checked = validate_ghost_ids(&topology, &extents, &ghost_ids);
        let ghost_positions =
            agree_on_outcome(comm, checked, "ghost communicator construction")?;

        let plan = GhostCommPlan::build(comm, &extents, &ghost_ids, tags.plan)?;
        let scatter = ghost_ids
            .iter()
            .map(|&gid| plan.recv_position(gid).ok_or(VecError::UnknownGhostId(gid)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            topology,
            extents,
            ghost_ids,
            ghost_positions,
            scatter,
            plan,
            tags,
        })
    }

    #[inline]
    pub fn topology(&self) -> ProcessTopology {
        self.topology
    }
    #[inline]
    pub fn extents(&self) -> &OwnershipExtents {
        &self.extents
    }
    #[inline]
    pub fn plan(&self) -> &GhostCommPlan {
        &self.plan
    }
    #[inline]
    pub fn tags(&self) -> GhostCommTags {
        self.tags
    }
    #[inline]
    pub fn ghost_ids(&self) -> &[u64] {
        &self.ghost_ids
    }
    #[inline]
    pub fn num_ghosts(&self) -> usize {
        self.ghost_ids.len()
    }

    pub fn local_size(&self) -> usize {
        self.extents
            .local_size(self.topology.rank())
            .map_or(0, |n| n as usize)
    }

    #[inline]
    pub fn global_size(&self) -> u64 {
        self.extents.global_size()
    }

    #[inline]
    pub fn find_owner(&self, global_id: u64) -> Result<usize, VecError> {
        self.extents.find_owner(global_id)
    }

    /// Index of `ghost_id` in a ghosted buffer: `local_size + position`.
    pub fn map_ghost_to_local(&self, ghost_id: u64) -> Result<usize, VecError> {
        self.ghost_positions
            .get(&ghost_id)
            .map(|&pos| self.local_size() + pos)
            .ok_or(VecError::UnknownGhostId(ghost_id))
    }

    /// Zeroed buffer of `local_size + num_ghosts` entries.
    pub fn make_ghosted_vector<T: Pod>(&self) -> Vec<T> {
        vec![T::zeroed(); self.local_size() + self.num_ghosts()]
    }

    /// `local` followed by a zeroed ghost region.
    pub fn make_ghosted_vector_from<T: Pod>(&self, local: &[T]) -> Result<Vec<T>, VecError> {
        self.check_len("local values", self.local_size(), local.len())?;
        let mut out = Vec::with_capacity(local.len() + self.num_ghosts());
        out.extend_from_slice(local);
        out.resize(local.len() + self.num_ghosts(), T::zeroed());
        Ok(out)
    }

    /// Collective: fill `ghosts` with the owners' current values of
    /// `ghost_ids`.
    ///
    /// The buffer lengths are checked on every rank and the outcome is agreed
    /// before any value moves, so a bad buffer on one rank fails the exchange
    /// on all of them. The communicator is checked first and locally: a
    /// communicator of a different rank or size belongs to another group and
    /// cannot reach this one's peers.
    pub fn communicate<C, T>(&self, comm: &C, local: &[T], ghosts: &mut [T]) -> Result<(), VecError>
    where
        C: Communicator + ?Sized,
        T: Pod,
    {
        self.check_comm(comm)?;
        let lengths = self
            .check_len("local values", self.local_size(), local.len())
            .and_then(|()| self.check_len("ghost buffer", self.num_ghosts(), ghosts.len()));
        agree_on_outcome(comm, lengths, "ghost exchange")?;
        self.exchange(comm, local, ghosts)
    }

    /// Collective: refresh the ghost region of one `local ++ ghosts` buffer.
    pub fn communicate_ghost_entries<C, T>(&self, comm: &C, ghosted: &mut [T]) -> Result<(), VecError>
    where
        C: Communicator + ?Sized,
        T: Pod,
    {
        self.check_comm(comm)?;
        let local_size = self.local_size();
        let length = self.check_len("ghosted buffer", local_size + self.num_ghosts(), ghosted.len());
        agree_on_outcome(comm, length, "ghost exchange")?;
        let (local, ghosts) = ghosted.split_at_mut(local_size);
        self.exchange(comm, local, ghosts)
    }

    fn exchange<C, T>(&self, comm: &C, local: &[T], ghosts: &mut [T]) -> Result<(), VecError>
    where
        C: Communicator + ?Sized,
        T: Pod,
    {
        let plan = &self.plan;
        let sendbuf: Vec<T> = plan.local_ids_to_send().iter().map(|&i| local[i]).collect();
        let recvbuf = all_to_all_v(
            comm,
            &sendbuf,
            plan.sendcounts(),
            plan.senddispls(),
            plan.recvcounts(),
            plan.recvdispls(),
            self.tags.values,
        )?;
        for (slot, &pos) in ghosts.iter_mut().zip(&self.scatter) {
            *slot = recvbuf[pos];
        }
        log::trace!(
            "rank {}: ghost exchange sent {}, received {}",
            self.topology.rank(),
            sendbuf.len(),
            recvbuf.len()
        );
        Ok(())
    }

    fn check_comm<C: Communicator + ?Sized>(&self, comm: &C) -> Result<(), VecError> {
        let got = comm.topology();
        if got != self.topology {
            return Err(VecError::CommunicatorMismatch {
                expected: self.topology,
                got,
            });
        }
        Ok(())
    }

    fn check_len(&self, what: &'static str, expected: usize, got: usize) -> Result<(), VecError> {
        if expected == got {
            Ok(())
        } else {
            Err(VecError::LengthMismatch {
                what,
                expected,
                got,
            })
        }
    }
}

/// Local checks on a ghost index set; returns id -> position on success.
fn validate_ghost_ids(
    topology: &ProcessTopology,
    extents: &OwnershipExtents,
    ghost_ids: &[u64],
) -> Result<HashMap<u64, usize>, VecError> {
    if extents.num_ranks() != topology.size() {
        return Err(VecError::LengthMismatch {
            what: "extents rank count",
            expected: topology.size(),
            got: extents.num_ranks(),
        });
    }
    let me = topology.rank();
    let mut positions = HashMap::with_capacity(ghost_ids.len());
    for (pos, &gid) in ghost_ids.iter().enumerate() {
        if extents.find_owner(gid)? == me {
            return Err(VecError::GhostIdLocallyOwned { id: gid, rank: me });
        }
        if positions.insert(gid, pos).is_some() {
            return Err(VecError::DuplicateGhostId(gid));
        }
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_has_no_ghosts() {
        let gc = VectorGhostCommunicator::new(&NoComm, 3, 3, vec![]).unwrap();
        assert_eq!(gc.local_size(), 3);
        assert_eq!(gc.num_ghosts(), 0);
        let mut buf = gc.make_ghosted_vector_from(&[1.0f64, 2.0, 3.0]).unwrap();
        gc.communicate_ghost_entries(&NoComm, &mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn construction_rejects_bad_input() {
        assert_eq!(
            VectorGhostCommunicator::new(&NoComm, 3, 4, vec![]).unwrap_err(),
            VecError::GlobalSizeMismatch {
                declared: 4,
                computed: 3
            }
        );
        assert!(matches!(
            VectorGhostCommunicator::new(&NoComm, 3, 3, vec![7]),
            Err(VecError::InvalidGlobalId { id: 7, .. })
        ));
        assert_eq!(
            VectorGhostCommunicator::new(&NoComm, 3, 3, vec![1]).unwrap_err(),
            VecError::GhostIdLocallyOwned { id: 1, rank: 0 }
        );
    }

    #[test]
    fn length_checked_before_exchange() {
        let gc = VectorGhostCommunicator::new(&NoComm, 2, 2, vec![]).unwrap();
        let mut ghosts: [f64; 0] = [];
        let err = gc.communicate(&NoComm, &[1.0f64], &mut ghosts).unwrap_err();
        assert_eq!(
            err,
            VecError::LengthMismatch {
                what: "local values",
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn bad_ghost_on_one_rank_fails_all() {
        let comms = RayonComm::group(2);
        let results: Vec<Result<VectorGhostCommunicator, VecError>> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        // rank 1 asks for its own id 2
                        let ghosts = if c.rank() == 0 { vec![3] } else { vec![2] };
                        VectorGhostCommunicator::new(c, 2, 4, ghosts)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(matches!(results[0], Err(VecError::PeerFailed { rank: 0, .. })));
        assert_eq!(
            results[1].as_ref().unwrap_err(),
            &VecError::GhostIdLocallyOwned { id: 2, rank: 1 }
        );
    }

    #[test]
    fn ghost_slots_follow_declared_order() {
        // extents [0,2,4,6]; rank 0 wants {5, 2, 4}
        let comms = RayonComm::group(3);
        let got: Vec<Vec<u32>> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let ghosts = if c.rank() == 0 { vec![5, 2, 4] } else { vec![] };
                        let gc = VectorGhostCommunicator::new(c, 2, 6, ghosts).unwrap();
                        let base = 2 * c.rank() as u32;
                        let mut buf = gc.make_ghosted_vector_from(&[base * 10, (base + 1) * 10]).unwrap();
                        gc.communicate_ghost_entries(c, &mut buf).unwrap();
                        if c.rank() == 0 {
                            assert_eq!(gc.map_ghost_to_local(5).unwrap(), 2);
                            assert_eq!(gc.map_ghost_to_local(4).unwrap(), 4);
                            assert_eq!(gc.map_ghost_to_local(3), Err(VecError::UnknownGhostId(3)));
                        }
                        buf
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got[0], vec![0, 10, 50, 20, 40]);
        assert_eq!(got[1], vec![20, 30]);
    }
}
