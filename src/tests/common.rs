use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::axiom::AxiomSet;
use crate::collector::{Collector, Strategy};
use crate::config::{EnumerationConfig, NecessitationLimit, RedundancyFilter};

/// A small configuration, so the balancer gets exercised even on short runs.
pub fn test_config(necessitation: NecessitationLimit) -> EnumerationConfig {
    EnumerationConfig {
        necessitation,
        workers: 4,
        queue_capacity: 32,
        balance_interval: Duration::from_millis(1),
        redundancy_filter: RedundancyFilter::Enabled,
    }
}

/// Collects every length up to `target` with the standard axioms.
pub fn collect(config: EnumerationConfig, target: u32, strategy: Strategy) -> Collector {
    let mut collector = Collector::new(AxiomSet::standard(), config);
    if let Err(e) = collector.collect_up_to(target, strategy, &CancellationToken::new(), |_, _| {
        Ok(())
    }) {
        panic!("collection failed: {}", e);
    }
    collector
}

/// The number of representatives per length.
pub fn table_counts(collector: &Collector) -> BTreeMap<u32, usize> {
    let mut answer = BTreeMap::new();
    for (length, _) in collector.table().iter() {
        *answer.entry(length).or_insert(0) += 1;
    }
    answer
}

/// The conclusion keys per length.
pub fn conclusion_keys(collector: &Collector) -> BTreeMap<u32, BTreeSet<String>> {
    let mut answer = BTreeMap::new();
    for (length, _) in collector.table().iter() {
        answer.entry(length).or_insert_with(|| {
            collector
                .representatives(length)
                .into_iter()
                .map(|(_, conclusion)| conclusion.key())
                .collect()
        });
    }
    answer
}

/// Asserts that every representative's proof really derives its registered conclusion.
pub fn check_representatives(collector: &Collector) {
    for (length, proof) in collector.table().iter() {
        assert_eq!(proof.len() as u32, length, "{} has the wrong length", proof);
        let derivation = match crate::proof::parse_proof_string(proof, collector.axioms()) {
            Ok(derivation) => derivation,
            Err(e) => panic!("representative {} does not parse: {}", proof, e),
        };
        assert_eq!(
            collector.registry().proof_of(&derivation.key()).as_deref(),
            Some(proof.as_str()),
            "{} is not the registered proof of {}",
            proof,
            derivation.key()
        );
    }
}
