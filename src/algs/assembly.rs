//! Deferred assembly: resolve queued set/add operations across ranks.
//!
//! # Steps
//! 1. Drain the local cache (it is left empty whatever happens next).
//! 2. Agree on the group mode: all-gather every rank's [`CacheMode`] and take
//!    the maximum. Any rank whose non-empty mode differs from the maximum, or
//!    any mixed rank, fails the assembly on **every** rank with the same
//!    [`VecError::ModeMismatch`], so no rank proceeds alone into the exchange.
//! 3. Nothing queued anywhere: return.
//! 4. Split operations into locally owned ones and per-owner remote ones.
//! 5. Ship remote ones as 16-byte records with one map all-to-all.
//! 6. Every rank decodes its received records and checks that each id is
//!    its own; the outcome is agreed across the group, so a malformed or
//!    foreign record fails the assembly on every rank before anything is
//!    applied.
//! 7. Apply local operations, then remote ones.
//!
//! Adds commute, so their result does not depend on arrival order. For sets
//! targeting the same id the rule is deterministic: the owner's own sets are
//! applied first, then remote sets in increasing source-rank order, each
//! source's records in the order they were queued. The last write wins.

use std::collections::BTreeMap;
use std::ops::Range;

use hashbrown::HashMap;

use crate::algs::communicator::{
    CommTag, Communicator, ExchangeCommTags, agree_on_outcome, all_gather_value,
};
use crate::algs::exchange::map_all_to_all;
use crate::algs::wire::{WireVecOp, decode_vec_ops, encode_vec_ops};
use crate::data::op_cache::{CacheMode, OpCache};
use crate::topology::extents::OwnershipExtents;
use crate::vec_error::VecError;

/// Communication tags for the assembly record exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AssemblyCommTags {
    pub records: ExchangeCommTags,
}

impl AssemblyCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            records: ExchangeCommTags::from_base(base),
        }
    }
}

impl Default for AssemblyCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0xA55E))
    }
}

/// Collective: agree on the group operation mode.
///
/// Returns the group mode, or the same `ModeMismatch` on every rank.
pub fn agree_on_mode<C>(comm: &C, local_mode: CacheMode) -> Result<CacheMode, VecError>
where
    C: Communicator + ?Sized,
{
    let modes: Vec<CacheMode> = all_gather_value(comm, &local_mode.as_u8())?
        .into_iter()
        .map(|raw| CacheMode::from_u8(raw).unwrap_or(CacheMode::Mixed))
        .collect();
    let global_mode = modes.iter().copied().max().unwrap_or_default();
    let offenders: Vec<(usize, CacheMode)> = modes
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, m)| m == CacheMode::Mixed || (m != CacheMode::Empty && m != global_mode))
        .collect();
    if !offenders.is_empty() {
        return Err(VecError::ModeMismatch {
            rank: comm.rank(),
            local_mode,
            global_mode,
            offenders,
        });
    }
    Ok(global_mode)
}

/// Collective: drain `cache` and apply every queued operation to the owning
/// rank's `values`.
///
/// `values` holds at least this rank's owned entries (a trailing ghost region
/// is never touched). Must be called by every rank of `comm`, even ranks with
/// nothing queued.
///
/// A rank that receives malformed or foreign records returns that protocol
/// error; every other rank returns a fatal [`VecError::PeerFailed`]. No rank
/// applies anything in that case.
pub fn assemble_values<C>(
    comm: &C,
    extents: &OwnershipExtents,
    values: &mut [f64],
    cache: &mut OpCache,
    tags: AssemblyCommTags,
) -> Result<(), VecError>
where
    C: Communicator + ?Sized,
{
    let me = comm.rank();
    let drained = cache.drain();
    let own = extents.range(me)?;

    let mode = agree_on_mode(comm, drained.mode)?;
    if mode == CacheMode::Empty {
        return Ok(());
    }

    // split local vs. remote; ids were range-checked when queued
    let mut local_ops = Vec::new();
    let mut outgoing: BTreeMap<usize, Vec<(u64, f64)>> = BTreeMap::new();
    for (gid, value) in drained.ops {
        let owner = extents.find_owner(gid)?;
        if owner == me {
            local_ops.push((gid, value));
        } else {
            outgoing.entry(owner).or_default().push((gid, value));
        }
    }

    let send: BTreeMap<usize, Vec<u8>> = outgoing
        .iter()
        .map(|(&owner, ops)| (owner, encode_vec_ops(ops)))
        .collect();
    let received = map_all_to_all(comm, &send, tags.records)?;

    // every rank validates its buffer and its whole incoming batch, then the
    // group agrees; nothing is applied anywhere unless all ranks passed
    let local_size = (own.end - own.start) as usize;
    let checked = check_buffer(values.len(), local_size)
        .and_then(|()| decode_incoming(me, &own, &received));
    let incoming = agree_on_outcome(comm, checked, "assembly")?;
    let values = &mut values[..local_size];

    let mut writer = SetTracker::new(mode);
    for &(gid, value) in &local_ops {
        let lid = (gid - own.start) as usize;
        apply(mode, &mut values[lid], value);
        writer.record(gid, me);
    }

    let mut n_remote = 0usize;
    for (src, ops) in incoming {
        for (gid, value) in ops {
            let lid = (gid - own.start) as usize;
            apply(mode, &mut values[lid], value);
            writer.record(gid, src);
            n_remote += 1;
        }
    }

    log::debug!(
        "rank {me}: assembled {mode:?}: {} local, {} sent to {} ranks, {n_remote} received",
        local_ops.len(),
        outgoing.values().map(Vec::len).sum::<usize>(),
        outgoing.len()
    );
    Ok(())
}

fn check_buffer(len: usize, local_size: usize) -> Result<(), VecError> {
    if len < local_size {
        return Err(VecError::LengthMismatch {
            what: "assembly value buffer",
            expected: local_size,
            got: len,
        });
    }
    Ok(())
}

/// Decode every received buffer and check each target id is owned here.
fn decode_incoming(
    me: usize,
    own: &Range<u64>,
    received: &BTreeMap<usize, Vec<u8>>,
) -> Result<Vec<(usize, Vec<(u64, f64)>)>, VecError> {
    let mut incoming = Vec::with_capacity(received.len());
    for (&src, bytes) in received {
        let ops = decode_vec_ops(bytes).ok_or(VecError::MalformedRecords {
            rank: me,
            source_rank: src,
            len: bytes.len(),
            record_size: WireVecOp::SIZE,
        })?;
        if let Some(&(gid, _)) = ops.iter().find(|(gid, _)| !own.contains(gid)) {
            return Err(VecError::ForeignAssemblyTarget {
                rank: me,
                source_rank: src,
                id: gid,
                start: own.start,
                end: own.end,
            });
        }
        incoming.push((src, ops));
    }
    Ok(incoming)
}

#[inline]
fn apply(mode: CacheMode, slot: &mut f64, value: f64) {
    match mode {
        CacheMode::Set => *slot = value,
        _ => *slot += value,
    }
}

/// Warns when more than one rank sets the same id in one assembly.
struct SetTracker {
    last_writer: Option<HashMap<u64, usize>>,
}

impl SetTracker {
    fn new(mode: CacheMode) -> Self {
        Self {
            last_writer: (mode == CacheMode::Set).then(HashMap::new),
        }
    }

    fn record(&mut self, gid: u64, rank: usize) {
        if let Some(map) = self.last_writer.as_mut() {
            if let Some(prev) = map.insert(gid, rank) {
                if prev != rank {
                    log::warn!(
                        "global id {gid} set by both rank {prev} and rank {rank}; rank {rank} wins"
                    );
                }
            }
        }
    }
}
