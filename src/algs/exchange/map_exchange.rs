//! Stage 3: the map all-to-all used by the ghost plan builder and assembly.
//!
//! Input is, on each rank, `destination → records`; output is
//! `source → records` holding exactly what each source sent here. Per-pair
//! record order is preserved. Destinations absent from the input send
//! nothing, and sources that sent nothing are absent from the output.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::algs::communicator::{Communicator, ExchangeCommTags};
use crate::algs::exchange::data_exchange::all_to_all_v;
use crate::algs::exchange::displacements;
use crate::algs::exchange::size_exchange::exchange_counts;
use crate::vec_error::VecError;

/// Collective: exchange per-destination record lists.
///
/// Counts go first (fixed-size all-to-all), displacements are prefix sums,
/// the payload travels in one variable-length all-to-all.
pub fn map_all_to_all<T, C>(
    comm: &C,
    send: &BTreeMap<usize, Vec<T>>,
    tags: ExchangeCommTags,
) -> Result<BTreeMap<usize, Vec<T>>, VecError>
where
    T: Pod,
    C: Communicator + ?Sized,
{
    let topo = comm.topology();
    for &dest in send.keys() {
        topo.check_rank(dest)?;
    }

    let sendcounts: Vec<usize> = topo
        .ranks()
        .map(|r| send.get(&r).map_or(0, Vec::len))
        .collect();
    let senddispls = displacements(&sendcounts);

    let recvcounts = exchange_counts(comm, &sendcounts, tags.sizes)?;
    let recvdispls = displacements(&recvcounts);

    let mut sendbuf = Vec::with_capacity(sendcounts.iter().sum());
    for records in send.values() {
        sendbuf.extend_from_slice(records);
    }

    let recvbuf = all_to_all_v(
        comm,
        &sendbuf,
        &sendcounts,
        &senddispls,
        &recvcounts,
        &recvdispls,
        tags.data,
    )?;

    let received: BTreeMap<usize, Vec<T>> = topo
        .ranks()
        .filter(|&r| recvcounts[r] > 0)
        .map(|r| {
            let lo = recvdispls[r];
            (r, recvbuf[lo..lo + recvcounts[r]].to_vec())
        })
        .collect();

    log::debug!(
        "rank {}: map all-to-all sent {} records to {} ranks, received {} from {} ranks",
        topo.rank(),
        sendbuf.len(),
        send.values().filter(|v| !v.is_empty()).count(),
        recvbuf.len(),
        received.len()
    );
    Ok(received)
}
