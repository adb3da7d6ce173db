//! `ProcessTopology`: the identity of one rank within a fixed process group.
//!
//! Rank and group size are fixed for the lifetime of every vector built on
//! top; the group is never resized. A topology is an explicit value handed to
//! constructors rather than ambient process-wide state, so independent
//! vectors (and unit tests with in-process groups) can coexist.

use std::fmt;
use std::ops::Range;

use crate::vec_error::VecError;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ProcessTopology {
    rank: usize,
    size: usize,
}

impl ProcessTopology {
    /// Create a topology, checking `size > 0` and `rank < size`.
    pub fn new(rank: usize, size: usize) -> Result<Self, VecError> {
        if size == 0 || rank >= size {
            return Err(VecError::InvalidRank { rank, size });
        }
        Ok(Self { rank, size })
    }

    /// The single-rank topology.
    #[inline]
    pub const fn serial() -> Self {
        Self { rank: 0, size: 1 }
    }

    #[inline]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn is_serial(&self) -> bool {
        self.size == 1
    }

    /// All ranks of the group, in increasing order.
    #[inline]
    pub fn ranks(&self) -> Range<usize> {
        0..self.size
    }

    /// All ranks except this one, in increasing order.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranks().filter(move |&r| r != self.rank)
    }

    /// Return `Err(InvalidRank)` unless `rank` is a group member.
    pub fn check_rank(&self, rank: usize) -> Result<(), VecError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(VecError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }
}

impl Default for ProcessTopology {
    fn default() -> Self {
        Self::serial()
    }
}

impl fmt::Display for ProcessTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.size)
    }
}
