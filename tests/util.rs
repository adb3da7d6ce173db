#![allow(dead_code)]
use ghost_vec::algs::communicator::RayonComm;

/// Run `f` on every rank of a fresh in-process group of `n` ranks and
/// collect the per-rank results in rank order.
pub fn run_ranks<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&RayonComm) -> R + Sync,
{
    let comms = RayonComm::group(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms.iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Like [`run_ranks`], but reports per-rank panics instead of propagating.
pub fn run_ranks_catching<R, F>(n: usize, f: F) -> Vec<std::thread::Result<R>>
where
    R: Send,
    F: Fn(&RayonComm) -> R + Sync,
{
    let comms = RayonComm::group(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms.iter().map(|c| s.spawn(move || f(c))).collect();
        handles.into_iter().map(|h| h.join()).collect()
    })
}

/// Prefix-sum bounds for a list of local sizes.
pub fn bounds_of(sizes: &[u64]) -> Vec<u64> {
    std::iter::once(0)
        .chain(sizes.iter().scan(0u64, |acc, &n| {
            *acc += n;
            Some(*acc)
        }))
        .collect()
}
