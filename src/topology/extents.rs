//! Ownership extents: the global index → owning rank map.
//!
//! Rank `r` exclusively owns global indices `[extents[r], extents[r+1])`.
//! Extents are created once per vector from every rank's local size (one
//! all-gather plus a prefix sum) and never change afterwards.
//!
//! Every rank must build extents from the same local sizes. If ranks
//! disagree, owner lookups silently diverge; the ghost plan builder and the
//! assembly protocol both detect the symptom (a peer addressing an id the
//! receiver does not own) and report it as a fatal protocol error.

use std::ops::Range;

use crate::algs::communicator::{Communicator, all_gather_value};
use crate::debug_invariants::DebugInvariants;
use crate::vec_error::VecError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct OwnershipExtents {
    /// `num_ranks + 1` non-decreasing bounds, `bounds[0] == 0`.
    bounds: Vec<u64>,
}

impl OwnershipExtents {
    /// Collective: all-gather `local_size` across the group and prefix-sum it.
    ///
    /// Must be called by every rank of `comm`.
    pub fn build<C: Communicator>(comm: &C, local_size: u64) -> Result<Self, VecError> {
        let sizes = all_gather_value(comm, &local_size)?;
        let extents = Self::from_local_sizes(&sizes)?;
        extents.debug_assert_invariants_on(comm.rank());
        log::debug!(
            "rank {}: built extents over {} ranks, global size {}",
            comm.rank(),
            extents.num_ranks(),
            extents.global_size()
        );
        Ok(extents)
    }

    /// Prefix-sum per-rank sizes into extents.
    pub fn from_local_sizes(local_sizes: &[u64]) -> Result<Self, VecError> {
        if local_sizes.is_empty() {
            return Err(VecError::InvalidExtents(
                "at least one rank is required".into(),
            ));
        }
        let mut bounds = Vec::with_capacity(local_sizes.len() + 1);
        let mut acc = 0u64;
        bounds.push(acc);
        for &n in local_sizes {
            acc = acc.checked_add(n).ok_or(VecError::SizeOverflow)?;
            bounds.push(acc);
        }
        Ok(Self { bounds })
    }

    /// Adopt explicit bounds after validating them.
    pub fn from_bounds(bounds: Vec<u64>) -> Result<Self, VecError> {
        let extents = Self { bounds };
        extents.validate_invariants()?;
        Ok(extents)
    }

    #[inline]
    pub fn bounds(&self) -> &[u64] {
        &self.bounds
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.bounds.len() - 1
    }

    #[inline]
    pub fn global_size(&self) -> u64 {
        self.bounds[self.bounds.len() - 1]
    }

    /// Global ids owned by `rank`.
    pub fn range(&self, rank: usize) -> Result<Range<u64>, VecError> {
        if rank >= self.num_ranks() {
            return Err(VecError::InvalidRank {
                rank,
                size: self.num_ranks(),
            });
        }
        Ok(self.bounds[rank]..self.bounds[rank + 1])
    }

    pub fn local_size(&self, rank: usize) -> Result<u64, VecError> {
        self.range(rank).map(|r| r.end - r.start)
    }

    /// Rank owning `global_id`.
    ///
    /// Binary search over the bounds; ranks with zero local size are skipped
    /// naturally since they own an empty range.
    pub fn find_owner(&self, global_id: u64) -> Result<usize, VecError> {
        if global_id >= self.global_size() {
            return Err(VecError::InvalidGlobalId {
                id: global_id,
                global_size: self.global_size(),
            });
        }
        // first bound strictly greater than id, minus one
        Ok(self.bounds.partition_point(|&b| b <= global_id) - 1)
    }

    #[inline]
    pub fn is_owned_by(&self, global_id: u64, rank: usize) -> bool {
        rank < self.num_ranks() && self.bounds[rank] <= global_id && global_id < self.bounds[rank + 1]
    }

    /// Local offset of `global_id` on `rank`, if `rank` owns it.
    #[inline]
    pub fn to_local(&self, global_id: u64, rank: usize) -> Option<usize> {
        self.is_owned_by(global_id, rank)
            .then(|| (global_id - self.bounds[rank]) as usize)
    }
}

impl TryFrom<Vec<u64>> for OwnershipExtents {
    type Error = VecError;

    fn try_from(bounds: Vec<u64>) -> Result<Self, VecError> {
        Self::from_bounds(bounds)
    }
}

impl From<OwnershipExtents> for Vec<u64> {
    fn from(extents: OwnershipExtents) -> Self {
        extents.bounds
    }
}

impl DebugInvariants for OwnershipExtents {
    const LABEL: &'static str = "OwnershipExtents";

    fn validate_invariants(&self) -> Result<(), VecError> {
        if self.bounds.len() < 2 {
            return Err(VecError::InvalidExtents(format!(
                "need at least 2 bounds, got {}",
                self.bounds.len()
            )));
        }
        if self.bounds[0] != 0 {
            return Err(VecError::InvalidExtents(format!(
                "first bound must be 0, got {}",
                self.bounds[0]
            )));
        }
        if let Some(r) = self.bounds.windows(2).position(|w| w[0] > w[1]) {
            return Err(VecError::InvalidExtents(format!(
                "bounds decrease at rank {r}: {} > {}",
                self.bounds[r],
                self.bounds[r + 1]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn two_rank_layout() {
        let e = OwnershipExtents::from_local_sizes(&[3, 2]).unwrap();
        assert_eq!(e.bounds(), &[0, 3, 5]);
        assert_eq!(e.find_owner(0).unwrap(), 0);
        assert_eq!(e.find_owner(2).unwrap(), 0);
        assert_eq!(e.find_owner(3).unwrap(), 1);
        assert_eq!(e.find_owner(4).unwrap(), 1);
        assert!(matches!(
            e.find_owner(5),
            Err(VecError::InvalidGlobalId { id: 5, global_size: 5 })
        ));
        assert_eq!(e.to_local(4, 1), Some(1));
        assert_eq!(e.to_local(4, 0), None);
    }

    #[test]
    fn empty_ranks_own_nothing() {
        let e = OwnershipExtents::from_local_sizes(&[0, 2, 0, 1]).unwrap();
        assert_eq!(e.find_owner(0).unwrap(), 1);
        assert_eq!(e.find_owner(1).unwrap(), 1);
        assert_eq!(e.find_owner(2).unwrap(), 3);
        assert_eq!(e.local_size(2).unwrap(), 0);
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(OwnershipExtents::from_bounds(vec![1, 3]).is_err());
        assert!(OwnershipExtents::from_bounds(vec![0, 3, 2]).is_err());
        assert!(OwnershipExtents::from_bounds(vec![0]).is_err());
        assert!(OwnershipExtents::from_local_sizes(&[u64::MAX, 1]).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let e: OwnershipExtents = serde_json::from_str("[0,2,5]").unwrap();
        assert_eq!(e.global_size(), 5);
        assert!(serde_json::from_str::<OwnershipExtents>("[0,4,2]").is_err());
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0,2,5]");
    }

    proptest! {
        #[test]
        fn prefix_sum_shape(sizes in proptest::collection::vec(0u64..50, 1..12)) {
            let e = OwnershipExtents::from_local_sizes(&sizes).unwrap();
            let total: u64 = sizes.iter().sum();
            prop_assert_eq!(e.bounds()[0], 0);
            prop_assert_eq!(e.global_size(), total);
            prop_assert!(e.bounds().windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(e.validate_invariants().is_ok());
        }

        #[test]
        fn owner_is_unique(sizes in proptest::collection::vec(0u64..20, 1..8)) {
            let e = OwnershipExtents::from_local_sizes(&sizes).unwrap();
            for id in 0..e.global_size() {
                let owner = e.find_owner(id).unwrap();
                let owning: Vec<usize> =
                    (0..e.num_ranks()).filter(|&r| e.is_owned_by(id, r)).collect();
                prop_assert_eq!(owning, vec![owner]);
            }
            prop_assert!(e.find_owner(e.global_size()).is_err());
        }
    }
}
