//! Stage 1 of the exchange: tell every rank how many records to expect.
//!
//! A fixed-size all-to-all: every rank sends exactly one [`WireCount`] to
//! every rank (including itself), even when the count is zero, so receivers
//! never have to guess which peers will talk to them.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::data_exchange::all_to_all_v;
use crate::algs::wire::WireCount;
use crate::vec_error::VecError;

/// Collective: `send_counts[r]` is how many records this rank will send to
/// rank `r`. Returns `recv_counts[r]`, how many records rank `r` will send
/// here.
pub fn exchange_counts<C>(
    comm: &C,
    send_counts: &[usize],
    tag: CommTag,
) -> Result<Vec<usize>, VecError>
where
    C: Communicator + ?Sized,
{
    let size = comm.size();
    if send_counts.len() != size {
        return Err(VecError::LengthMismatch {
            what: "send counts",
            expected: size,
            got: send_counts.len(),
        });
    }
    let wire: Vec<WireCount> = send_counts.iter().map(|&n| WireCount::new(n)).collect();
    let ones = vec![1usize; size];
    let displs: Vec<usize> = (0..size).collect();
    let recv = all_to_all_v(comm, &wire, &ones, &displs, &ones, &displs, tag)?;
    Ok(recv.iter().map(WireCount::get).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_counts_echo() {
        assert_eq!(exchange_counts(&NoComm, &[4], CommTag::new(1)).unwrap(), vec![4]);
        assert!(exchange_counts(&NoComm, &[4, 1], CommTag::new(1)).is_err());
    }

    #[test]
    fn counts_are_transposed() {
        // rank r sends (r + 1) * 10 + d records to rank d
        let comms = RayonComm::group(3);
        let got: Vec<Vec<usize>> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let counts: Vec<usize> = (0..3).map(|d| (c.rank() + 1) * 10 + d).collect();
                        exchange_counts(c, &counts, CommTag::new(0x20)).unwrap()
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (me, row) in got.iter().enumerate() {
            let want: Vec<usize> = (0..3).map(|src| (src + 1) * 10 + me).collect();
            assert_eq!(row, &want);
        }
    }
}
