//! The all-to-all exchange primitive, in three stages:
//!
//! 1. [`size_exchange`]: fixed-size all-to-all of per-destination counts,
//! 2. [`data_exchange`]: one variable-length all-to-all driven by
//!    counts/displacements,
//! 3. [`map_exchange`]: the `destination → records` to `source → records`
//!    wrapper combining the two.
//!
//! Both the ghost plan builder and the assembly protocol are expressed purely
//! in terms of these, so the distributed logic can be tested with the
//! in-process [`RayonComm`](crate::algs::communicator::RayonComm).

pub mod data_exchange;
pub mod map_exchange;
pub mod size_exchange;

pub use data_exchange::all_to_all_v;
pub use map_exchange::map_all_to_all;
pub use size_exchange::exchange_counts;

/// Exclusive prefix sum of `counts`.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0usize, |acc, &n| {
            let start = *acc;
            *acc += n;
            Some(start)
        })
        .collect()
}
