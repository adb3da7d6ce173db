mod util;
use util::*;

use std::collections::BTreeMap;

use ghost_vec::algs::assembly::{AssemblyCommTags, assemble_values};
use ghost_vec::algs::communicator::{CommTag, Communicator, agree_on_outcome, all_gather_value};
use ghost_vec::algs::exchange::map_all_to_all;
use ghost_vec::algs::wire::encode_vec_ops;
use ghost_vec::data::{CacheMode, OpCache, ParallelVector, VecOpType, VectorCommTags};
use ghost_vec::topology::OwnershipExtents;
use ghost_vec::vec_error::{OrAbort, VecError};
use proptest::prelude::*;

/// extents [0,3,5]; rank 0 holds [10,20,30], rank 1 holds [100,200].
fn two_rank_vector(c: &impl Communicator) -> ParallelVector {
    let (local, values): (usize, Vec<f64>) = if c.rank() == 0 {
        (3, vec![10.0, 20.0, 30.0])
    } else {
        (2, vec![100.0, 200.0])
    };
    let mut v = ParallelVector::new(c, local, 5).unwrap();
    v.set_local_values(&values).unwrap();
    v
}

#[test]
fn two_rank_add_scenario() {
    let out = run_ranks(2, |c| {
        let mut v = two_rank_vector(c);
        if c.rank() == 0 {
            v.add_value(0, 5.0).unwrap();
            v.add_value(3, 1.0).unwrap();
        } else {
            v.add_value(4, 2.0).unwrap();
        }
        v.assemble(c).unwrap();
        assert_eq!(v.pending_ops(), 0);
        v.make_local_vector()
    });
    assert_eq!(out[0], vec![15.0, 20.0, 30.0]);
    assert_eq!(out[1], vec![101.0, 202.0]);
}

#[test]
fn set_conflicts_resolve_owner_first_then_by_source_rank() {
    // every rank sets id 1 (owned by rank 0); rank 2 must win
    let out = run_ranks(3, |c| {
        let mut v = ParallelVector::new(c, 2, 6).unwrap();
        v.set_value(1, 10.0 * (c.rank() + 1) as f64).unwrap();
        v.set_value(4, -1.0).unwrap();
        v.assemble(c).unwrap();
        v.make_local_vector()
    });
    assert_eq!(out[0], vec![0.0, 30.0]);
    assert_eq!(out[2], vec![-1.0, 0.0]);
}

#[test]
fn later_set_on_one_rank_wins() {
    let out = run_ranks(2, |c| {
        let mut v = two_rank_vector(c);
        if c.rank() == 1 {
            v.set_values(&[0, 0, 2], &[1.0, 2.0, 3.0]).unwrap();
        }
        v.assemble(c).unwrap();
        v.make_local_vector()
    });
    assert_eq!(out[0], vec![2.0, 20.0, 3.0]);
}

#[test]
fn empty_assembly_is_a_cheap_noop() {
    let out = run_ranks(3, |c| {
        let mut v = ParallelVector::new(c, 1, 3).unwrap();
        v[0] = c.rank() as f64;
        v.assemble(c).unwrap();
        v.assemble(c).unwrap();
        v.make_local_vector()
    });
    assert_eq!(out, vec![vec![0.0], vec![1.0], vec![2.0]]);
}

#[test]
fn mixed_modes_on_one_rank_fail_every_rank() {
    let out = run_ranks(2, |c| {
        let mut v = two_rank_vector(c);
        if c.rank() == 0 {
            v.set_value(4, 1.0).unwrap();
            let err = v.add_value(4, 1.0).unwrap_err();
            assert!(matches!(err, VecError::MixedOperationModes { rank: 0, .. }));
            assert!(err.is_fatal());
            assert_eq!(v.cache_mode(), CacheMode::Mixed);
        }
        let res = v.assemble(c);
        (res, v.pending_ops(), v.make_local_vector())
    });
    for (rank, (res, pending, _)) in out.iter().enumerate() {
        match res {
            Err(e @ VecError::ModeMismatch { offenders, .. }) => {
                assert!(e.is_fatal(), "rank {rank}");
                assert_eq!(offenders, &vec![(0, CacheMode::Mixed)]);
            }
            other => panic!("rank {rank}: expected ModeMismatch, got {other:?}"),
        }
        assert_eq!(*pending, 0);
    }
    // nothing was applied anywhere
    assert_eq!(out[1].2, vec![100.0, 200.0]);
}

#[test]
fn cross_rank_mode_mismatch_fails_every_rank() {
    let out = run_ranks(3, |c| {
        let mut v = ParallelVector::new(c, 2, 6).unwrap();
        match c.rank() {
            0 => v.set_value(5, 1.0).unwrap(),
            1 => v.add_value(0, 1.0).unwrap(),
            _ => {}
        }
        let res = v.assemble(c);
        // the cache is clear, so a follow-up assembly agrees again
        let again = v.assemble(c);
        (res, again)
    });
    for (res, again) in out {
        match res {
            Err(VecError::ModeMismatch {
                global_mode,
                offenders,
                ..
            }) => {
                assert_eq!(global_mode, CacheMode::Add);
                assert_eq!(offenders, vec![(0, CacheMode::Set)]);
            }
            other => panic!("expected ModeMismatch, got {other:?}"),
        }
        assert!(again.is_ok());
    }
}

#[test]
fn or_abort_escalates_protocol_errors_to_the_group() {
    let out = run_ranks_catching(2, |c| {
        let mut v = two_rank_vector(c);
        match c.rank() {
            0 => v.set_value(4, 1.0).unwrap(),
            _ => v.add_value(0, 1.0).unwrap(),
        }
        v.assemble(c).or_abort(c, "assemble")
    });
    // RayonComm::abort panics on every rank that hits the fatal error
    assert!(out.iter().all(|r| r.is_err()));

    // invalid-argument errors pass through untouched
    let out = run_ranks(1, |c| {
        let mut v = ParallelVector::new(c, 1, 1).unwrap();
        v.add_value(7, 1.0).or_abort(c, "add_value")
    });
    assert!(matches!(out[0], Err(VecError::InvalidGlobalId { id: 7, .. })));
}

/// A rank that bypasses the cache and puts raw bytes on the assembly wire,
/// then joins the validation round like an honest peer.
fn rogue_send(
    c: &impl Communicator,
    tags: AssemblyCommTags,
    to: usize,
    payload: Vec<u8>,
) -> Result<(), VecError> {
    all_gather_value(c, &CacheMode::Add.as_u8()).unwrap();
    let mut send = BTreeMap::new();
    send.insert(to, payload);
    map_all_to_all(c, &send, tags.records).unwrap();
    agree_on_outcome(c, Ok(()), "assembly")
}

#[test]
fn truncated_records_fail_every_rank() {
    let tags = AssemblyCommTags::from_base(CommTag::new(0x3300));
    let extents = OwnershipExtents::from_local_sizes(&[2, 2]).unwrap();
    let out = run_ranks(2, |c| {
        if c.rank() == 0 {
            (rogue_send(c, tags, 1, vec![0u8; 17]), vec![])
        } else {
            let mut values = vec![1.0, 2.0];
            let mut cache = OpCache::new();
            let res = assemble_values(c, &extents, &mut values, &mut cache, tags);
            (res, values)
        }
    });
    assert_eq!(
        out[1].0,
        Err(VecError::MalformedRecords {
            rank: 1,
            source_rank: 0,
            len: 17,
            record_size: 16
        })
    );
    assert_eq!(out[1].1, vec![1.0, 2.0]);
    match &out[0].0 {
        Err(e @ VecError::PeerFailed { failed_ranks, .. }) => {
            assert_eq!(failed_ranks, &[1]);
            assert!(e.is_fatal());
        }
        other => panic!("sender should fail too, got {other:?}"),
    }
}

#[test]
fn foreign_target_rejected_before_anything_is_applied() {
    let tags = AssemblyCommTags::from_base(CommTag::new(0x3400));
    let extents = OwnershipExtents::from_local_sizes(&[2, 2]).unwrap();
    let out = run_ranks(2, |c| {
        if c.rank() == 0 {
            // id 3 is rank 1's, id 0 is not
            let res = rogue_send(c, tags, 1, encode_vec_ops(&[(3, 5.0), (0, 1.0)]));
            (res, vec![], true)
        } else {
            let mut values = vec![1.0, 2.0];
            let mut cache = OpCache::new();
            cache.push(1, VecOpType::AddValue, 2, 1.0).unwrap();
            let res = assemble_values(c, &extents, &mut values, &mut cache, tags);
            (res, values, cache.is_empty())
        }
    });
    let (res, values, cleared) = out[1].clone();
    match res {
        Err(e @ VecError::ForeignAssemblyTarget { id: 0, source_rank: 0, .. }) => assert!(e.is_fatal()),
        other => panic!("unexpected {other:?}"),
    }
    // the whole assembly is rejected, local entries included
    assert_eq!(values, vec![1.0, 2.0]);
    assert!(cleared);
    assert!(out[0].0.as_ref().is_err_and(VecError::is_fatal));
}

#[test]
fn distinct_tag_sets_do_not_interfere() {
    let out = run_ranks(2, |c| {
        let local = if c.rank() == 0 { 3 } else { 2 };
        let mut a = ParallelVector::with_tags(c, local, 5, VectorCommTags::from_base(CommTag::new(0x100)))
            .unwrap();
        let mut b = ParallelVector::with_tags(c, local, 5, VectorCommTags::from_base(CommTag::new(0x200)))
            .unwrap();
        a.add_value(4 - c.rank() as u64, 1.0).unwrap();
        b.add_value(c.rank() as u64, 2.0).unwrap();
        a.assemble(c).unwrap();
        b.assemble(c).unwrap();
        (a.make_local_vector(), b.make_local_vector())
    });
    assert_eq!(out[0], (vec![0.0, 0.0, 0.0], vec![2.0, 2.0, 0.0]));
    assert_eq!(out[1], (vec![1.0, 1.0], vec![0.0, 0.0]));
}

fn contributions() -> impl Strategy<Value = (Vec<u64>, Vec<(usize, u64, i32)>)> {
    proptest::collection::vec(1u64..5, 1..4).prop_flat_map(|sizes| {
        let n = sizes.len();
        let total: u64 = sizes.iter().sum();
        (
            Just(sizes),
            proptest::collection::vec((0..n, 0..total, -10i32..10), 0..30),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn add_assembly_sums_every_contribution((sizes, adds) in contributions()) {
        let bounds = bounds_of(&sizes);
        let total = *bounds.last().unwrap();
        let out = run_ranks(sizes.len(), |c| {
            let me = c.rank();
            let mut v = ParallelVector::new(c, sizes[me] as usize, total).unwrap();
            let own: Vec<f64> = (bounds[me]..bounds[me + 1]).map(|g| g as f64).collect();
            v.set_local_values(&own).unwrap();
            for &(_, gid, val) in adds.iter().filter(|(r, _, _)| *r == me) {
                v.add_value(gid, val as f64).unwrap();
            }
            v.assemble(c).unwrap();
            v.make_local_vector()
        });
        let mut want: Vec<f64> = (0..total).map(|g| g as f64).collect();
        for &(_, gid, val) in &adds {
            want[gid as usize] += val as f64;
        }
        let got: Vec<f64> = out.into_iter().flatten().collect();
        prop_assert_eq!(got, want);
    }
}
