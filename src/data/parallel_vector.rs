//! `ParallelVector`: one rank's slice of a globally indexed `f64` vector.
//!
//! The rank exclusively owns the global ids `extents.range(rank)` and may
//! read/write them directly by local index. Writes to any other id go through
//! the deferred queue ([`ParallelVector::set_value`] /
//! [`ParallelVector::add_value`]) and land on the owner at the next
//! collective [`ParallelVector::assemble`].
//!
//! The value buffer may carry a trailing ghost region (see
//! [`GhostedParallelVector`](crate::data::ghosted_vector::GhostedParallelVector)).
//! Every operation here works on the owned prefix only.

use std::fmt;
use std::ops::{Index, IndexMut, Range};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::algs::assembly::{AssemblyCommTags, assemble_values};
use crate::algs::communicator::{
    CommTag, Communicator, ReduceOp, agree_on_outcome, all_reduce_value,
};
use crate::data::ghost_communicator::GhostCommTags;
use crate::data::op_cache::{CacheMode, OpCache, VecOpType};
use crate::topology::extents::OwnershipExtents;
use crate::topology::process::ProcessTopology;
use crate::vec_error::VecError;

/// Every tag a vector uses, derived from one base.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VectorCommTags {
    pub ghost: GhostCommTags,
    pub assembly: AssemblyCommTags,
}

impl VectorCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            ghost: GhostCommTags::from_base(base),
            assembly: AssemblyCommTags::from_base(base.offset(4)),
        }
    }
}

impl Default for VectorCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x7100))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NormType {
    /// Sum of absolute values.
    L1,
    /// Euclidean norm.
    L2,
    /// Largest absolute value.
    LInf,
}

#[derive(Clone, Debug)]
pub struct ParallelVector {
    topology: ProcessTopology,
    extents: OwnershipExtents,
    local_size: usize,
    /// owned entries, then the ghost region (if any)
    values: Vec<f64>,
    cache: OpCache,
    tags: VectorCommTags,
}

impl ParallelVector {
    /// Collective: zeroed vector with `local_size` entries on this rank.
    ///
    /// `global_size` must equal the sum of every rank's `local_size`;
    /// a mismatch fails on every rank.
    pub fn new<C: Communicator>(comm: &C, local_size: usize, global_size: u64) -> Result<Self, VecError> {
        Self::with_tags(comm, local_size, global_size, VectorCommTags::default())
    }

    pub fn with_tags<C: Communicator>(
        comm: &C,
        local_size: usize,
        global_size: u64,
        tags: VectorCommTags,
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
        agree_on_outcome(comm, declared, "vector construction")?;
        Self::from_extents(comm, extents, tags)
    }

    /// Zeroed vector over existing extents. Not collective.
    pub fn from_extents<C: Communicator + ?Sized>(
        comm: &C,
        extents: OwnershipExtents,
        tags: VectorCommTags,
    ) -> Result<Self, VecError> {
        let topology = comm.topology();
        if extents.num_ranks() != topology.size() {
            return Err(VecError::LengthMismatch {
                what: "extents rank count",
                expected: topology.size(),
                got: extents.num_ranks(),
            });
        }
        Ok(Self::with_ghost_region(topology, extents, tags, 0))
    }

    pub(crate) fn with_ghost_region(
        topology: ProcessTopology,
        extents: OwnershipExtents,
        tags: VectorCommTags,
        num_ghosts: usize,
    ) -> Self {
        let local_size = extents
            .local_size(topology.rank())
            .map_or(0, |n| n as usize);
        Self {
            topology,
            extents,
            local_size,
            values: vec![0.0; local_size + num_ghosts],
            cache: OpCache::new(),
            tags,
        }
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
    pub fn tags(&self) -> VectorCommTags {
        self.tags
    }
    #[inline]
    pub fn local_size(&self) -> usize {
        self.local_size
    }
    #[inline]
    pub fn global_size(&self) -> u64 {
        self.extents.global_size()
    }

    /// Global ids owned by this rank.
    pub fn owned_range(&self) -> Range<u64> {
        let start = self.extents.bounds()[self.topology.rank()];
        start..start + self.local_size as u64
    }

    // --- local access ---

    #[inline]
    pub fn local_values(&self) -> &[f64] {
        &self.values[..self.local_size]
    }

    #[inline]
    pub fn local_values_mut(&mut self) -> &mut [f64] {
        &mut self.values[..self.local_size]
    }

    pub fn try_get(&self, local_id: usize) -> Result<f64, VecError> {
        self.local_values()
            .get(local_id)
            .copied()
            .ok_or(VecError::InvalidLocalId {
                index: local_id,
                len: self.local_size,
            })
    }

    pub fn try_get_mut(&mut self, local_id: usize) -> Result<&mut f64, VecError> {
        let len = self.local_size;
        self.local_values_mut()
            .get_mut(local_id)
            .ok_or(VecError::InvalidLocalId {
                index: local_id,
                len,
            })
    }

    /// Copy of the owned entries.
    pub fn make_local_vector(&self) -> Vec<f64> {
        self.local_values().to_vec()
    }

    pub(crate) fn buffer(&self) -> &[f64] {
        &self.values
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    // --- whole-vector updates ---

    pub fn fill(&mut self, value: f64) {
        self.local_values_mut().fill(value);
    }

    /// Overwrite all owned entries.
    pub fn set_local_values(&mut self, values: &[f64]) -> Result<(), VecError> {
        if values.len() != self.local_size {
            return Err(VecError::LengthMismatch {
                what: "local values",
                expected: self.local_size,
                got: values.len(),
            });
        }
        self.local_values_mut().copy_from_slice(values);
        Ok(())
    }

    /// Overwrite owned entries `offset..offset + values.len()`.
    pub fn block_set(&mut self, offset: usize, values: &[f64]) -> Result<(), VecError> {
        let range = block_range("block set", offset, values.len(), self.local_size)?;
        self.local_values_mut()[range].copy_from_slice(values);
        Ok(())
    }

    /// Copy every owned entry of `src`, which must have the same layout.
    pub fn copy_local_values(&mut self, src: &ParallelVector) -> Result<(), VecError> {
        self.check_layout(src)?;
        let len = self.local_size;
        self.values[..len].copy_from_slice(src.local_values());
        Ok(())
    }

    /// Copy `len` owned entries of `src` starting at `src_offset` into this
    /// vector starting at `dst_offset`.
    pub fn block_copy_local_values(
        &mut self,
        src: &ParallelVector,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<(), VecError> {
        let from = block_range("block copy source", src_offset, len, src.local_size)?;
        let to = block_range("block copy destination", dst_offset, len, self.local_size)?;
        self.local_values_mut()[to].copy_from_slice(&src.local_values()[from]);
        Ok(())
    }

    // --- deferred operations ---

    /// Queue `values[global_id] = value` for the next `assemble`.
    pub fn set_value(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.queue(VecOpType::SetValue, global_id, value)
    }

    /// Queue `values[global_id] += value` for the next `assemble`.
    pub fn add_value(&mut self, global_id: u64, value: f64) -> Result<(), VecError> {
        self.queue(VecOpType::AddValue, global_id, value)
    }

    /// Queue a batch of sets. Nothing is queued unless the whole batch is valid.
    pub fn set_values(&mut self, global_ids: &[u64], values: &[f64]) -> Result<(), VecError> {
        self.queue_batch(VecOpType::SetValue, global_ids, values)
    }

    /// Queue a batch of adds. Nothing is queued unless the whole batch is valid.
    pub fn add_values(&mut self, global_ids: &[u64], values: &[f64]) -> Result<(), VecError> {
        self.queue_batch(VecOpType::AddValue, global_ids, values)
    }

    #[inline]
    pub fn pending_ops(&self) -> usize {
        self.cache.len()
    }

    #[inline]
    pub fn cache_mode(&self) -> CacheMode {
        self.cache.mode()
    }

    /// Collective: apply every rank's queued operations to their owners.
    ///
    /// The queue is empty afterwards whether or not assembly succeeds. The
    /// ghost region is never touched. Any failure inside the exchange is
    /// reported on every rank. The communicator check runs first and only
    /// locally: a communicator of another rank or size is not this vector's
    /// group, so the call never enters a collective with it.
    pub fn assemble<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), VecError> {
        if let Err(e) = self.check_comm(comm) {
            self.cache.drain();
            return Err(e);
        }
        let len = self.local_size;
        assemble_values(
            comm,
            &self.extents,
            &mut self.values[..len],
            &mut self.cache,
            self.tags.assembly,
        )
    }

    fn queue(&mut self, op: VecOpType, global_id: u64, value: f64) -> Result<(), VecError> {
        self.check_global_id(global_id)?;
        self.cache.push(self.topology.rank(), op, global_id, value)
    }

    fn queue_batch(&mut self, op: VecOpType, global_ids: &[u64], values: &[f64]) -> Result<(), VecError> {
        if global_ids.len() != values.len() {
            return Err(VecError::LengthMismatch {
                what: "batched values",
                expected: global_ids.len(),
                got: values.len(),
            });
        }
        for &gid in global_ids {
            self.check_global_id(gid)?;
        }
        for (&gid, &v) in global_ids.iter().zip(values) {
            self.cache.push(self.topology.rank(), op, gid, v)?;
        }
        Ok(())
    }

    // --- arithmetic on owned entries ---

    /// `self += y`
    pub fn add_assign_vector(&mut self, y: &ParallelVector) -> Result<(), VecError> {
        self.plus_ay(1.0, y)
    }

    /// `self += a * y`
    pub fn plus_ay(&mut self, a: f64, y: &ParallelVector) -> Result<(), VecError> {
        self.check_layout(y)?;
        let y = y.local_values();
        zip_apply(self.local_values_mut(), y, |x, y| *x += a * y);
        Ok(())
    }

    /// `self = a * self + y`
    pub fn ax_plus_y(&mut self, a: f64, y: &ParallelVector) -> Result<(), VecError> {
        self.check_layout(y)?;
        let y = y.local_values();
        zip_apply(self.local_values_mut(), y, |x, y| *x = a * *x + y);
        Ok(())
    }

    pub fn scale(&mut self, a: f64) {
        map_apply(self.local_values_mut(), |x| *x *= a);
    }

    pub fn shift(&mut self, a: f64) {
        map_apply(self.local_values_mut(), |x| *x += a);
    }

    /// Collective: global norm over every rank's owned entries.
    pub fn compute_norm<C: Communicator + ?Sized>(&self, comm: &C, norm: NormType) -> Result<f64, VecError> {
        self.check_comm(comm)?;
        let x = self.local_values();
        match norm {
            NormType::L1 => all_reduce_value(comm, sum_of(x, f64::abs), ReduceOp::Sum),
            NormType::L2 => Ok(all_reduce_value(comm, sum_of(x, |v| v * v), ReduceOp::Sum)?.sqrt()),
            NormType::LInf => all_reduce_value(comm, max_abs(x), ReduceOp::Max),
        }
    }

    // --- copies ---

    /// Same layout and values; the deferred queue is not copied.
    pub fn make_copy(&self) -> Self {
        Self {
            values: self.values.clone(),
            cache: OpCache::new(),
            ..self.make_layout()
        }
    }

    /// Same layout, zeroed.
    pub fn make_clone(&self) -> Self {
        Self {
            values: vec![0.0; self.values.len()],
            ..self.make_layout()
        }
    }

    fn make_layout(&self) -> Self {
        Self {
            topology: self.topology,
            extents: self.extents.clone(),
            local_size: self.local_size,
            values: Vec::new(),
            cache: OpCache::new(),
            tags: self.tags,
        }
    }

    // --- checks ---

    fn check_global_id(&self, global_id: u64) -> Result<(), VecError> {
        if global_id < self.global_size() {
            Ok(())
        } else {
            Err(VecError::InvalidGlobalId {
                id: global_id,
                global_size: self.global_size(),
            })
        }
    }

    pub(crate) fn check_comm<C: Communicator + ?Sized>(&self, comm: &C) -> Result<(), VecError> {
        let got = comm.topology();
        if got != self.topology {
            return Err(VecError::CommunicatorMismatch {
                expected: self.topology,
                got,
            });
        }
        Ok(())
    }

    fn check_layout(&self, other: &ParallelVector) -> Result<(), VecError> {
        if self.local_size != other.local_size || self.global_size() != other.global_size() {
            return Err(VecError::IncompatibleLayout {
                lhs_local: self.local_size,
                rhs_local: other.local_size,
                lhs_global: self.global_size(),
                rhs_global: other.global_size(),
            });
        }
        Ok(())
    }
}

fn block_range(what: &'static str, offset: usize, len: usize, bound: usize) -> Result<Range<usize>, VecError> {
    match offset.checked_add(len) {
        Some(end) if end <= bound => Ok(offset..end),
        _ => Err(VecError::RangeOutOfBounds {
            what,
            offset,
            end: offset.saturating_add(len),
            len: bound,
        }),
    }
}

// local kernels; data-parallel with the `rayon` feature

#[cfg(feature = "rayon")]
fn zip_apply(x: &mut [f64], y: &[f64], f: impl Fn(&mut f64, f64) + Sync + Send) {
    x.par_iter_mut().zip(y.par_iter()).for_each(|(x, &y)| f(x, y));
}

#[cfg(not(feature = "rayon"))]
fn zip_apply(x: &mut [f64], y: &[f64], f: impl Fn(&mut f64, f64)) {
    x.iter_mut().zip(y).for_each(|(x, &y)| f(x, y));
}

#[cfg(feature = "rayon")]
fn map_apply(x: &mut [f64], f: impl Fn(&mut f64) + Sync + Send) {
    x.par_iter_mut().for_each(f);
}

#[cfg(not(feature = "rayon"))]
fn map_apply(x: &mut [f64], f: impl Fn(&mut f64)) {
    x.iter_mut().for_each(f);
}

#[cfg(feature = "rayon")]
fn sum_of(x: &[f64], f: impl Fn(f64) -> f64 + Sync + Send) -> f64 {
    x.par_iter().map(|&v| f(v)).sum()
}

#[cfg(not(feature = "rayon"))]
fn sum_of(x: &[f64], f: impl Fn(f64) -> f64) -> f64 {
    x.iter().map(|&v| f(v)).sum()
}

fn max_abs(x: &[f64]) -> f64 {
    x.iter().fold(0.0, |m, v| m.max(v.abs()))
}

impl Index<usize> for ParallelVector {
    type Output = f64;

    fn index(&self, local_id: usize) -> &f64 {
        &self.local_values()[local_id]
    }
}

impl IndexMut<usize> for ParallelVector {
    fn index_mut(&mut self, local_id: usize) -> &mut f64 {
        &mut self.local_values_mut()[local_id]
    }
}

impl fmt::Display for ParallelVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.local_values().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}
