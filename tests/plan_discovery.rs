use std::sync::Arc;

use mesh_distributor::algs::communicator::Communicator;
use mesh_distributor::distributor::{Distributor, DistributorParams, HowInitialized};
use mesh_distributor::prelude::DebugInvariants;
use mesh_distributor::DistributorError;
use proptest::prelude::*;

mod util;
use util::{SkewedComm, run_ranks, scattered_dests};

#[test]
fn four_process_discovery() {
    // rank 0 sends 3 items to rank 1 and 2 items to rank 3; nobody else sends
    let plans = run_ranks(4, |comm| {
        let mut dist = Distributor::new(&comm);
        let exports = if comm.rank() == 0 {
            vec![Some(3), Some(1), Some(1), Some(3), Some(1)]
        } else {
            Vec::new()
        };
        let n = dist.create_from_sends(&exports).unwrap();
        assert_eq!(n, dist.total_receive_length());
        Arc::clone(dist.plan())
    });

    let p0 = &plans[0];
    assert_eq!(p0.procs_to(), &[3, 1]);
    assert_eq!(p0.lengths_to(), &[2, 3]);
    assert_eq!(p0.starts_to(), &[0, 2]);
    assert_eq!(p0.indices_to(), Some(&[0, 3, 1, 2, 4][..]));
    assert_eq!(p0.num_sends(), 2);
    assert_eq!(p0.max_send_length(), 3);
    assert!(!p0.send_message_to_self());
    assert_eq!(p0.total_receive_length(), 0);

    assert_eq!(plans[1].procs_from(), &[0]);
    assert_eq!(plans[1].lengths_from(), &[3]);
    assert_eq!(plans[1].total_receive_length(), 3);
    assert_eq!(plans[2].num_receives(), 0);
    assert_eq!(plans[2].total_receive_length(), 0);
    assert_eq!(plans[3].lengths_from(), &[2]);

    for plan in &plans {
        assert_eq!(plan.how_initialized(), HowInitialized::FromSends);
        plan.validate_invariants().unwrap();
    }
}

#[test]
fn forward_and_reverse_lengths_agree_per_peer() {
    let plans = run_ranks(3, |comm| {
        let mut dist = Distributor::new(&comm);
        let dests = scattered_dests(comm.rank(), 3, 17);
        dist.create_from_sends(&dests).unwrap();
        Arc::clone(dist.plan())
    });
    for (r, plan) in plans.iter().enumerate() {
        let rev = plan.reverse_plan();
        assert_eq!(rev.how_initialized(), HowInitialized::Reverse);
        assert_eq!(rev.procs_to(), plan.procs_from());
        assert_eq!(rev.lengths_to(), plan.lengths_from());
        assert_eq!(rev.procs_from(), plan.procs_to());
        assert_eq!(rev.lengths_from(), plan.lengths_to());
        assert_eq!(rev.total_receive_length(), plan.total_send_length());
        assert_eq!(rev.num_sends(), plan.num_receives());
        assert_eq!(rev.send_message_to_self(), plan.send_message_to_self());
        rev.validate_invariants().unwrap();

        // what r sends to p equals what p receives from r
        for (&p, &len) in plan.procs_to().iter().zip(plan.lengths_to()) {
            let peer = &plans[p];
            let j = peer.procs_from().iter().position(|&q| q == r).unwrap();
            assert_eq!(peer.lengths_from()[j], len);
        }
    }
}

#[test]
fn reverse_plan_is_memoized_until_rebuilt() {
    run_ranks(2, |comm| {
        let mut dist = Distributor::new(&comm);
        dist.create_from_sends(&[Some(0), Some(1)]).unwrap();
        let plan = Arc::clone(dist.plan());
        assert!(Arc::ptr_eq(&plan.reverse_plan(), &plan.reverse_plan()));

        dist.create_from_sends(&[Some(1)]).unwrap();
        let rebuilt = dist.plan();
        assert!(!Arc::ptr_eq(&plan.reverse_plan(), &rebuilt.reverse_plan()));
        assert_eq!(rebuilt.reverse_plan().lengths_from(), &[1]);
    });
}

#[test]
fn bad_process_ids_fail_everywhere() {
    let results = run_ranks(3, |comm| {
        let mut dist = Distributor::new(&comm);
        let exports = if comm.rank() == 1 {
            vec![Some(0), Some(7), None, Some(3)]
        } else {
            vec![Some(0)]
        };
        dist.create_from_sends(&exports)
    });
    match &results[1] {
        Err(DistributorError::InvalidProcessIds {
            rank,
            num_procs,
            num_bad,
            offending,
        }) => {
            assert_eq!((*rank, *num_procs, *num_bad), (1, 3, 2));
            assert_eq!(offending, &vec![(1, 7), (3, 3)]);
        }
        other => panic!("unexpected {other:?}"),
    }
    for r in [0, 2] {
        assert_eq!(
            results[r],
            Err(DistributorError::RemoteInvalidProcessIds { ranks: vec![1] })
        );
    }
}

#[test]
fn offending_ids_are_bounded_by_print_threshold() {
    let results = run_ranks(1, |comm| {
        let params = DistributorParams::default().with_print_threshold(2);
        let mut dist = Distributor::with_params(&comm, params).unwrap();
        dist.create_from_sends(&[Some(5), Some(6), Some(7)])
    });
    let err = results[0].clone().unwrap_err();
    assert!(matches!(
        &err,
        DistributorError::InvalidProcessIds { num_bad: 3, offending, .. } if offending.len() == 2
    ));
    assert!(err.to_string().contains("(1 more)"), "{err}");
}

#[test]
fn length_disagreement_is_fatal() {
    let results = run_ranks(2, |inner| {
        let comm = SkewedComm {
            inner,
            from: 0,
            to: 1,
        };
        let mut dist = Distributor::new(&comm);
        let exports = if comm.rank() == 0 {
            vec![Some(1), Some(1), Some(1)]
        } else {
            vec![]
        };
        dist.create_from_sends(&exports).map(|_| ())
    });
    assert_eq!(results[0], Ok(()));
    match &results[1] {
        Err(DistributorError::LengthMismatch { rank: 1, mismatches, .. }) => {
            assert_eq!(mismatches.len(), 1);
            assert_eq!(mismatches[0].peer, 0);
            assert_eq!((mismatches[0].discovered, mismatches[0].received), (4, 3));
        }
        other => panic!("unexpected {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn discovery_matches_global_counts(
        dests in proptest::collection::vec(
            proptest::collection::vec(proptest::option::weighted(0.8, 0usize..3), 0..20),
            3,
        )
    ) {
        let dests_ref = &dests;
        let plans = run_ranks(3, |comm| {
            let me = comm.rank();
            let mut dist = Distributor::new(&comm);
            dist.create_from_sends(&dests_ref[me]).unwrap();
            Arc::clone(dist.plan())
        });
        for (r, plan) in plans.iter().enumerate() {
            let mut expected = [0usize; 3];
            for (src, list) in dests.iter().enumerate() {
                let n = list.iter().filter(|&&d| d == Some(r)).count();
                expected[src] = n;
            }
            let got: Vec<(usize, usize)> = plan
                .procs_from()
                .iter()
                .copied()
                .zip(plan.lengths_from().iter().copied())
                .collect();
            let want: Vec<(usize, usize)> =
                (0..3).filter(|&p| expected[p] > 0).map(|p| (p, expected[p])).collect();
            prop_assert_eq!(got, want);
            prop_assert!(plan.validate_invariants().is_ok());
            prop_assert_eq!(plan.export_order().len(), plan.total_send_length());
        }
    }
}
