//! Deferred set/add operation queues for one rank.
//!
//! A rank queues `(global_id, value)` pairs with [`OpCache::push`] and drains
//! them in the collective assembly step. At most one of the two queues is
//! non-empty at any time: queuing a set while adds are pending (or the
//! reverse) is rejected and leaves the cache in [`CacheMode::Mixed`] until the
//! next assembly, which then fails on every rank.

use crate::vec_error::VecError;

/// Which deferred operation a value is queued for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum VecOpType {
    /// Overwrite the owner's value.
    SetValue,
    /// Accumulate into the owner's value.
    AddValue,
}

/// Local operation mode, ordered so that the group mode is the maximum.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CacheMode {
    #[default]
    Empty = 0,
    Set = 1,
    Add = 2,
    Mixed = 3,
}

impl CacheMode {
    /// Decode a mode byte received from a peer.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Set),
            2 => Some(Self::Add),
            3 => Some(Self::Mixed),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<VecOpType> for CacheMode {
    fn from(op: VecOpType) -> Self {
        match op {
            VecOpType::SetValue => CacheMode::Set,
            VecOpType::AddValue => CacheMode::Add,
        }
    }
}

/// Pending operations drained by one assembly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainedOps {
    pub mode: CacheMode,
    pub ops: Vec<(u64, f64)>,
}

#[derive(Clone, Debug, Default)]
pub struct OpCache {
    set_cache: Vec<(u64, f64)>,
    add_cache: Vec<(u64, f64)>,
    mixed: bool,
}

impl OpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one operation. The id must already be range-checked.
    pub fn push(
        &mut self,
        rank: usize,
        op: VecOpType,
        global_id: u64,
        value: f64,
    ) -> Result<(), VecError> {
        let (queue, other, other_mode) = match op {
            VecOpType::SetValue => (&mut self.set_cache, &self.add_cache, CacheMode::Add),
            VecOpType::AddValue => (&mut self.add_cache, &self.set_cache, CacheMode::Set),
        };
        if !other.is_empty() {
            self.mixed = true;
            return Err(VecError::MixedOperationModes {
                rank,
                attempted: op.into(),
                pending_mode: other_mode,
                pending: other.len(),
            });
        }
        queue.push((global_id, value));
        Ok(())
    }

    pub fn mode(&self) -> CacheMode {
        if self.mixed {
            return CacheMode::Mixed;
        }
        match (self.set_cache.is_empty(), self.add_cache.is_empty()) {
            (true, true) => CacheMode::Empty,
            (false, true) => CacheMode::Set,
            (true, false) => CacheMode::Add,
            (false, false) => CacheMode::Mixed,
        }
    }

    pub fn len(&self) -> usize {
        self.set_cache.len() + self.add_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every pending operation and reset the cache, including the mixed
    /// flag. Always leaves both queues empty.
    pub fn drain(&mut self) -> DrainedOps {
        let mode = self.mode();
        let set = std::mem::take(&mut self.set_cache);
        let add = std::mem::take(&mut self.add_cache);
        self.mixed = false;
        let ops = match mode {
            CacheMode::Set => set,
            CacheMode::Add => add,
            _ => Vec::new(),
        };
        DrainedOps { mode, ops }
    }
}
