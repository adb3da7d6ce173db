//! Fixed-size, little-endian wire types for exchange and assembly paths.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

use crate::vec_error::VecError;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), VecError> {
    if actual == expected {
        Ok(())
    } else {
        Err(VecError::LengthMismatch {
            what: "wire buffer",
            expected,
            got: actual,
        })
    }
}

/// Item count carried in the size round of a map all-to-all.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// One deferred set/add operation: `(global_id, value)`.
///
/// Exactly 16 bytes: the id as a little-endian `u64`, then the IEEE-754 bits
/// of the value as a little-endian `u64`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireVecOp {
    pub global_id_le: u64,
    pub value_bits_le: u64,
}
impl WireVecOp {
    pub const SIZE: usize = 16;

    pub fn new(global_id: u64, value: f64) -> Self {
        Self {
            global_id_le: global_id.to_le(),
            value_bits_le: value.to_bits().to_le(),
        }
    }
    pub fn global_id(&self) -> u64 {
        u64::from_le(self.global_id_le)
    }
    pub fn value(&self) -> f64 {
        f64::from_bits(u64::from_le(self.value_bits_le))
    }
}

/// Serialize operations into a flat record buffer.
pub fn encode_vec_ops(ops: &[(u64, f64)]) -> Vec<u8> {
    let records: Vec<WireVecOp> = ops.iter().map(|&(id, v)| WireVecOp::new(id, v)).collect();
    cast_slice(&records).to_vec()
}

/// Decode a flat record buffer. `None` if the length is not a whole number
/// of records; the caller decides how to report it.
pub fn decode_vec_ops(bytes: &[u8]) -> Option<Vec<(u64, f64)>> {
    if bytes.len() % WireVecOp::SIZE != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(WireVecOp::SIZE)
            .map(|chunk| {
                let rec: WireVecOp = bytemuck::pod_read_unaligned(chunk);
                (rec.global_id(), rec.value())
            })
            .collect(),
    )
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireVecOp>(), WireVecOp::SIZE);
const_assert_eq!(align_of::<WireVecOp>(), 8);
