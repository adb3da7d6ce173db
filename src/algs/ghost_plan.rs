//! Ghost communication plan: the reusable send/receive schedule for refreshing
//! a rank's ghost values.
//!
//! The plan is a pure function of `(extents, ghost_ids)` and is built with
//! one map all-to-all:
//!
//! 1. group the wanted ghost ids by owning rank,
//! 2. lay out the receive buffer by increasing owner rank, and within an
//!    owner in the order the ids were grouped,
//! 3. derive `recvcounts`/`recvdispls` from that layout,
//! 4. send every owner the list of ids wanted from it; what comes back is
//!    the list of *our* ids each peer wants,
//! 5. check every requested id is actually ours (anything else means the
//!    ranks disagree on the extents) and share the outcome, so the build
//!    fails on every rank or on none,
//! 6. convert those ids to local offsets, grouped by increasing requester
//!    rank, and derive `sendcounts`/`senddispls`.
//!
//! The receive layout from step 2 is the contract between building the plan
//! and using it in [`VectorGhostCommunicator`](crate::data::ghost_communicator::VectorGhostCommunicator).

use std::collections::BTreeMap;
use std::ops::Range;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::algs::communicator::{Communicator, ExchangeCommTags, agree_on_outcome};
use crate::algs::exchange::{displacements, map_all_to_all};
use crate::debug_invariants::DebugInvariants;
use crate::topology::extents::OwnershipExtents;
use crate::vec_error::VecError;

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GhostCommPlan {
    sendcounts: Vec<usize>,
    senddispls: Vec<usize>,
    recvcounts: Vec<usize>,
    recvdispls: Vec<usize>,
    /// Local offsets to transmit, grouped by destination rank.
    local_ids_to_send: Vec<usize>,
    /// Position of each ghost id in the receive buffer.
    ghost_to_recv_map: HashMap<u64, usize>,
    local_size: usize,
}

impl GhostCommPlan {
    /// Collective: build the plan for `ghost_ids` on this rank.
    ///
    /// `ghost_ids` must be in range, not owned by this rank and free of
    /// duplicates; these are checked and the outcome agreed across the group
    /// before the request exchange.
    ///
    /// A peer requesting an id this rank does not own yields the fatal
    /// [`VecError::ForeignGhostRequest`] on that rank and a fatal
    /// [`VecError::PeerFailed`] on every other rank.
    pub fn build<C>(
        comm: &C,
        extents: &OwnershipExtents,
        ghost_ids: &[u64],
        tags: ExchangeCommTags,
    ) -> Result<Self, VecError>
    where
        C: Communicator + ?Sized,
    {
        let topo = comm.topology();
        let me = topo.rank();

        // 1) group wanted ids by owner
        let grouped = group_by_owner(me, topo.size(), extents, ghost_ids);
        let (own, recv_request) = agree_on_outcome(comm, grouped, "ghost plan build")?;

        // 2) receive-buffer position per ghost id, owner-rank ascending
        let ghost_to_recv_map: HashMap<u64, usize> = recv_request
            .values()
            .flatten()
            .enumerate()
            .map(|(pos, &gid)| (gid, pos))
            .collect();

        // 3) receive layout
        let recvcounts: Vec<usize> = topo
            .ranks()
            .map(|r| recv_request.get(&r).map_or(0, Vec::len))
            .collect();
        let recvdispls = displacements(&recvcounts);

        // 4) tell owners what we want; learn what peers want from us
        let send_request = map_all_to_all(comm, &recv_request, tags)?;

        // 5-6) validate and localize, requester-rank ascending; a foreign
        // request on any rank fails the build on every rank
        let localized = localize_requests(me, &own, &send_request);
        let local_ids_to_send = agree_on_outcome(comm, localized, "ghost plan build")?;
        let sendcounts: Vec<usize> = topo
            .ranks()
            .map(|r| send_request.get(&r).map_or(0, Vec::len))
            .collect();
        let senddispls = displacements(&sendcounts);

        let plan = Self {
            sendcounts,
            senddispls,
            recvcounts,
            recvdispls,
            local_ids_to_send,
            ghost_to_recv_map,
            local_size: (own.end - own.start) as usize,
        };
        plan.debug_assert_invariants_on(me);
        log::debug!(
            "rank {me}: ghost plan receives {} values from {} ranks, sends {} values to {} ranks",
            plan.num_recv(),
            plan.recvcounts.iter().filter(|&&n| n > 0).count(),
            plan.num_send(),
            plan.sendcounts.iter().filter(|&&n| n > 0).count()
        );
        Ok(plan)
    }

    #[inline]
    pub fn sendcounts(&self) -> &[usize] {
        &self.sendcounts
    }
    #[inline]
    pub fn senddispls(&self) -> &[usize] {
        &self.senddispls
    }
    #[inline]
    pub fn recvcounts(&self) -> &[usize] {
        &self.recvcounts
    }
    #[inline]
    pub fn recvdispls(&self) -> &[usize] {
        &self.recvdispls
    }
    #[inline]
    pub fn local_ids_to_send(&self) -> &[usize] {
        &self.local_ids_to_send
    }

    /// Position of `ghost_id` in the receive buffer.
    #[inline]
    pub fn recv_position(&self, ghost_id: u64) -> Option<usize> {
        self.ghost_to_recv_map.get(&ghost_id).copied()
    }

    #[inline]
    pub fn num_send(&self) -> usize {
        self.local_ids_to_send.len()
    }

    #[inline]
    pub fn num_recv(&self) -> usize {
        self.ghost_to_recv_map.len()
    }
}

/// Local checks on the ghost ids; returns the owned range and the wanted ids
/// grouped by owner.
fn group_by_owner(
    me: usize,
    num_ranks: usize,
    extents: &OwnershipExtents,
    ghost_ids: &[u64],
) -> Result<(Range<u64>, BTreeMap<usize, Vec<u64>>), VecError> {
    if extents.num_ranks() != num_ranks {
        return Err(VecError::LengthMismatch {
            what: "extents rank count",
            expected: num_ranks,
            got: extents.num_ranks(),
        });
    }
    let own = extents.range(me)?;
    let mut by_owner: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for &gid in ghost_ids {
        let owner = extents.find_owner(gid)?;
        if owner == me {
            return Err(VecError::GhostIdLocallyOwned { id: gid, rank: me });
        }
        by_owner.entry(owner).or_default().push(gid);
    }
    if let Some(dup) = ghost_ids.iter().duplicates().next() {
        return Err(VecError::DuplicateGhostId(*dup));
    }
    Ok((own, by_owner))
}

/// Turn the ids each peer requested into local offsets, checking ownership.
fn localize_requests(
    me: usize,
    own: &Range<u64>,
    requests: &BTreeMap<usize, Vec<u64>>,
) -> Result<Vec<usize>, VecError> {
    let mut local_ids = Vec::with_capacity(requests.values().map(Vec::len).sum());
    for (&requester, gids) in requests {
        for &gid in gids {
            if !own.contains(&gid) {
                return Err(VecError::ForeignGhostRequest {
                    rank: me,
                    requester,
                    id: gid,
                    start: own.start,
                    end: own.end,
                });
            }
            local_ids.push((gid - own.start) as usize);
        }
    }
    Ok(local_ids)
}

impl DebugInvariants for GhostCommPlan {
    const LABEL: &'static str = "GhostCommPlan";

    fn validate_invariants(&self) -> Result<(), VecError> {
        let total_recv: usize = self.recvcounts.iter().sum();
        if total_recv != self.ghost_to_recv_map.len() {
            return Err(VecError::LengthMismatch {
                what: "ghost plan receive total",
                expected: self.ghost_to_recv_map.len(),
                got: total_recv,
            });
        }
        let total_send: usize = self.sendcounts.iter().sum();
        if total_send != self.local_ids_to_send.len() {
            return Err(VecError::LengthMismatch {
                what: "ghost plan send total",
                expected: self.local_ids_to_send.len(),
                got: total_send,
            });
        }
        if self.senddispls != displacements(&self.sendcounts)
            || self.recvdispls != displacements(&self.recvcounts)
        {
            return Err(VecError::InvalidExtents(
                "ghost plan displacements are not prefix sums of counts".into(),
            ));
        }
        if let Some(&bad) = self.local_ids_to_send.iter().find(|&&i| i >= self.local_size) {
            return Err(VecError::InvalidLocalId {
                index: bad,
                len: self.local_size,
            });
        }
        if let Some(&bad) = self.ghost_to_recv_map.values().find(|&&p| p >= total_recv) {
            return Err(VecError::InvalidLocalId {
                index: bad,
                len: total_recv,
            });
        }
        Ok(())
    }
}
