use tokio_util::sync::CancellationToken;

use crate::axiom::AxiomSet;
use crate::collector::{Collector, Strategy};
use crate::config::NecessitationLimit;
use crate::proof::leading_necessitations;
use crate::tests::common::{
    check_representatives, collect, conclusion_keys, table_counts, test_config,
};

#[test]
fn test_bounded_necessitation_counts() {
    let collector = collect(
        test_config(NecessitationLimit::Bounded(1)),
        5,
        Strategy::Stepwise,
    );
    let counts: Vec<(u32, usize)> = table_counts(&collector).into_iter().collect();
    assert_eq!(counts, vec![(1, 3), (2, 3), (3, 6), (4, 9), (5, 15)]);
    assert_eq!(collector.table().get(2), &["N1", "N2", "N3"]);
    check_representatives(&collector);
}

#[test]
fn test_bounded_proofs_respect_the_limit() {
    let collector = collect(
        test_config(NecessitationLimit::Bounded(1)),
        5,
        Strategy::Stepwise,
    );
    for (_, proof) in collector.table().iter() {
        assert!(!proof.contains("NN"), "{} has two N in a row", proof);
        assert!(leading_necessitations(proof) <= 1);
    }
}

#[test]
fn test_unbounded_necessitation_counts() {
    let collector = collect(
        test_config(NecessitationLimit::Unbounded),
        5,
        Strategy::Stepwise,
    );
    let counts = table_counts(&collector);
    assert_eq!(counts.get(&1), Some(&3));
    assert_eq!(counts.get(&2), Some(&3));
    assert_eq!(counts.get(&3), Some(&9));
    assert_eq!(counts.get(&4), Some(&12));
    assert_eq!(counts.get(&5), Some(&27));
    assert!(collector.table().get(3).iter().any(|p| p == "NN1"));
    check_representatives(&collector);
}

#[test]
fn test_bounded_combined_matches_stepwise() {
    let stepwise = collect(
        test_config(NecessitationLimit::Bounded(1)),
        5,
        Strategy::Stepwise,
    );
    let combined = collect(
        test_config(NecessitationLimit::Bounded(1)),
        5,
        Strategy::Combined,
    );
    assert_eq!(conclusion_keys(&stepwise), conclusion_keys(&combined));
}

#[test]
fn test_unbounded_combined_matches_stepwise() {
    let stepwise = collect(
        test_config(NecessitationLimit::Unbounded),
        5,
        Strategy::Stepwise,
    );
    let combined = collect(
        test_config(NecessitationLimit::Unbounded),
        5,
        Strategy::Combined,
    );
    assert_eq!(conclusion_keys(&stepwise), conclusion_keys(&combined));
}

#[test]
fn test_every_length_is_a_round() {
    let mut collector = Collector::new(
        AxiomSet::standard(),
        test_config(NecessitationLimit::Bounded(2)),
    );
    let rounds = collector
        .collect_up_to(4, Strategy::Stepwise, &CancellationToken::new(), |_, _| Ok(()))
        .unwrap();
    let lengths: Vec<Vec<u32>> = rounds.iter().map(|r| r.lengths()).collect();
    assert_eq!(lengths, vec![vec![2], vec![3], vec![4]]);
    assert!(collector.table().get(3).iter().any(|p| p == "NN1"));
}
