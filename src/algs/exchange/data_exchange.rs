//! Stage 2 of the exchange: move the actual records.
//!
//! Both sides already agree on per-pair counts (from stage 1 or from a cached
//! ghost plan), so a pair with a zero count sends no message at all. The
//! point-to-point fallback guarantees that every send/receive handle is
//! drained before returning, even if an error occurs, so a bad message from
//! one peer never leaves another peer's request dangling.

use std::mem::size_of;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, cast_slice_mut};
use crate::vec_error::VecError;

/// Collective typed variable-length all-to-all.
///
/// `sendcounts`/`senddispls`/`recvcounts`/`recvdispls` are in elements of
/// `T`, indexed by rank. Returns a receive buffer just large enough for the
/// receive layout.
pub fn all_to_all_v<T, C>(
    comm: &C,
    sendbuf: &[T],
    sendcounts: &[usize],
    senddispls: &[usize],
    recvcounts: &[usize],
    recvdispls: &[usize],
    tag: CommTag,
) -> Result<Vec<T>, VecError>
where
    T: Pod,
    C: Communicator + ?Sized,
{
    let width = size_of::<T>();
    let in_bytes = |v: &[usize]| v.iter().map(|&n| n * width).collect::<Vec<_>>();

    let total = recvcounts
        .iter()
        .zip(recvdispls)
        .map(|(&n, &d)| n + d)
        .max()
        .unwrap_or(0);
    let mut recv = vec![T::zeroed(); total];

    comm.all_to_all_v_bytes(
        cast_slice(sendbuf),
        &in_bytes(sendcounts),
        &in_bytes(senddispls),
        cast_slice_mut(&mut recv),
        &in_bytes(recvcounts),
        &in_bytes(recvdispls),
        tag.as_u16(),
    )?;
    Ok(recv)
}

/// Check one side of an all-to-all layout against the group size and buffer.
pub(crate) fn check_layout(
    what: &'static str,
    size: usize,
    counts: &[usize],
    displs: &[usize],
    buf_len: usize,
) -> Result<(), VecError> {
    if counts.len() != size {
        return Err(VecError::LengthMismatch {
            what,
            expected: size,
            got: counts.len(),
        });
    }
    if displs.len() != size {
        return Err(VecError::LengthMismatch {
            what,
            expected: size,
            got: displs.len(),
        });
    }
    for (&n, &d) in counts.iter().zip(displs) {
        match d.checked_add(n) {
            Some(end) if end <= buf_len => {}
            _ => {
                return Err(VecError::RangeOutOfBounds {
                    what,
                    offset: d,
                    end: d.saturating_add(n),
                    len: buf_len,
                });
            }
        }
    }
    Ok(())
}

/// Point-to-point variable-length all-to-all over bytes. Default body of
/// [`Communicator::all_to_all_v_bytes`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn all_to_all_v_p2p<C>(
    comm: &C,
    sendbuf: &[u8],
    sendcounts: &[usize],
    senddispls: &[usize],
    recvbuf: &mut [u8],
    recvcounts: &[usize],
    recvdispls: &[usize],
    tag: u16,
) -> Result<(), VecError>
where
    C: Communicator + ?Sized,
{
    let topo = comm.topology();
    let (size, me) = (topo.size(), topo.rank());
    check_layout("all-to-all send layout", size, sendcounts, senddispls, sendbuf.len())?;
    check_layout("all-to-all recv layout", size, recvcounts, recvdispls, recvbuf.len())?;

    // 1) post all receives
    let mut pending_recvs = Vec::new();
    for peer in topo.peers().filter(|&p| recvcounts[p] > 0) {
        let mut scratch = vec![0u8; recvcounts[peer]];
        let h = comm.irecv(peer, tag, &mut scratch);
        pending_recvs.push((peer, h));
    }

    // 2) post all sends
    let mut pending_sends = Vec::new();
    for peer in topo.peers().filter(|&p| sendcounts[p] > 0) {
        let lo = senddispls[peer];
        pending_sends.push(comm.isend(peer, tag, &sendbuf[lo..lo + sendcounts[peer]]));
    }

    // 3) our own contribution never touches the transport
    let mut maybe_err = None;
    if sendcounts[me] == recvcounts[me] {
        let (s, r) = (senddispls[me], recvdispls[me]);
        recvbuf[r..r + recvcounts[me]].copy_from_slice(&sendbuf[s..s + sendcounts[me]]);
    } else {
        maybe_err = Some(VecError::BufferSizeMismatch {
            neighbor: me,
            expected: recvcounts[me],
            got: sendcounts[me],
        });
    }

    // 4) wait for all recvs, copy out (but do not early-return)
    for (peer, h) in pending_recvs {
        match h.wait() {
            Some(data) if data.len() == recvcounts[peer] => {
                if maybe_err.is_none() {
                    let r = recvdispls[peer];
                    recvbuf[r..r + data.len()].copy_from_slice(&data);
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(VecError::BufferSizeMismatch {
                    neighbor: peer,
                    expected: recvcounts[peer],
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(VecError::CommError {
                    neighbor: peer,
                    message: "no data received (wait returned None)".into(),
                });
            }
            _ => {} // already have an error; just drain
        }
        log::trace!("rank {me}: received {} bytes from rank {peer}", recvcounts[peer]);
    }

    // 5) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
