use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::axiom::AxiomSet;
use crate::balancer::{BalancerError, QueueBalancer};
use crate::config::EnumerationConfig;
use crate::generator::{Cancelled, Generator};
use crate::kernel::formula::Formula;
use crate::proof::{
    leading_necessitations, parse_proof_string, ProofError, ProofRef, RepresentativeTable,
};
use crate::registry::{InsertOutcome, Registry};
use crate::schema_index::SchemaIndex;
use crate::store::{Store, StoreError};

#[derive(Debug)]
pub enum CollectorError {
    Cancelled,
    Store(StoreError),

    /// The requested lengths don't continue the lengths already collected.
    InvalidLengths { lengths: Vec<u32>, known_limit: u32 },

    /// A stored proof doesn't derive anything, or derives something other than recorded.
    CorruptProof { proof: String, reason: String },
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CollectorError::Cancelled => write!(f, "cancelled"),
            CollectorError::Store(e) => write!(f, "{}", e),
            CollectorError::InvalidLengths {
                lengths,
                known_limit,
            } => write!(
                f,
                "cannot collect lengths {:?} with proofs known up to length {}",
                lengths, known_limit
            ),
            CollectorError::CorruptProof { proof, reason } => {
                write!(f, "stored proof {}: {}", proof, reason)
            }
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CollectorError {
    fn from(e: StoreError) -> Self {
        CollectorError::Store(e)
    }
}

impl From<BalancerError<Infallible>> for CollectorError {
    fn from(e: BalancerError<Infallible>) -> Self {
        match e {
            BalancerError::Evaluation(never) => match never {},
            BalancerError::Cancelled => CollectorError::Cancelled,
        }
    }
}

/// How to reach a target length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One round per length, each using the representatives of all shorter lengths.
    Stepwise,

    /// A single round generating every missing length from the current table.
    Combined,
}

/// Counters for a single proof length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LengthStats {
    pub length: u32,

    /// Candidates generated.
    pub iterations: u64,

    /// Candidates the generator was expected to produce. None when the count overflows.
    pub expected: Option<u64>,

    /// Candidates that don't derive anything.
    pub invalid: u64,

    /// Valid proofs that lost to a better proof of the same conclusion.
    pub redundant: u64,

    /// Conclusions dropped because a more general one was already proven.
    pub removals: u64,

    /// Representatives kept.
    pub representatives: u64,

    /// Whether the schema pass was skipped.
    pub unfiltered: bool,
}

/// Counters for one call to `collect_round`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub per_length: Vec<LengthStats>,
}

impl RoundStats {
    pub fn lengths(&self) -> Vec<u32> {
        self.per_length.iter().map(|s| s.length).collect()
    }

    pub fn iterations(&self) -> u64 {
        self.per_length.iter().map(|s| s.iterations).sum()
    }

    pub fn invalid(&self) -> u64 {
        self.per_length.iter().map(|s| s.invalid).sum()
    }

    pub fn redundant(&self) -> u64 {
        self.per_length.iter().map(|s| s.redundant).sum()
    }

    pub fn removals(&self) -> u64 {
        self.per_length.iter().map(|s| s.removals).sum()
    }

    /// Conclusions that survived the round.
    pub fn conclusions(&self) -> u64 {
        self.per_length.iter().map(|s| s.representatives).sum()
    }
}

/// Conclusions of the published proofs that don't start with `N`.
/// A candidate N...Nβ, where β is one of these, has conclusion □...□ of β's conclusion.
/// It is a snapshot taken before a round starts, so it only holds published lengths.
#[derive(Clone, Debug, Default)]
pub struct NecessitationIndex {
    conclusions: HashMap<String, Formula>,
}

impl NecessitationIndex {
    pub fn build(registry: &Registry, known_limit: u32) -> NecessitationIndex {
        let conclusions = registry
            .snapshot()
            .into_iter()
            .filter(|(_, e)| {
                e.proof.len() as u32 <= known_limit && leading_necessitations(&e.proof) == 0
            })
            .map(|(_, e)| (e.proof, e.conclusion))
            .collect();
        NecessitationIndex { conclusions }
    }

    pub fn len(&self) -> usize {
        self.conclusions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conclusions.is_empty()
    }

    /// The conclusion of a proof with leading necessitations, if its suffix is known.
    pub fn conclusion_of(&self, proof: &str) -> Option<Formula> {
        let count = leading_necessitations(proof);
        if count == 0 {
            return None;
        }
        let mut conclusion = self.conclusions.get(&proof[count as usize..])?.clone();
        for _ in 0..count {
            conclusion = Formula::necessity(conclusion);
        }
        Some(conclusion)
    }
}

// Per-length counters, indexed by length.
struct Counters {
    iterations: Vec<AtomicU64>,
    invalid: Vec<AtomicU64>,
    redundant: Vec<AtomicU64>,
}

impl Counters {
    fn new(max_length: u32) -> Counters {
        let make =
            || -> Vec<AtomicU64> { (0..=max_length).map(|_| AtomicU64::new(0)).collect() };
        Counters {
            iterations: make(),
            invalid: make(),
            redundant: make(),
        }
    }

    fn bump(counters: &[AtomicU64], length: usize) {
        if let Some(counter) = counters.get(length) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn get(counters: &[AtomicU64], length: u32) -> u64 {
        counters
            .get(length as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Builds the table of representative proofs, length by length.
pub struct Collector {
    axioms: AxiomSet,
    config: EnumerationConfig,
    table: RepresentativeTable,
    registry: Registry,
    history: Vec<RoundStats>,
}

impl Collector {
    /// Starts with just the axioms registered.
    pub fn new(axioms: AxiomSet, config: EnumerationConfig) -> Collector {
        let registry = Registry::new();
        let mut stats = LengthStats {
            length: 1,
            ..LengthStats::default()
        };
        let mut table = RepresentativeTable::with_axioms(&axioms);
        for i in 0..axioms.len() {
            let Some(proof) = table.resolve(ProofRef::Axiom(i as u8)) else {
                continue;
            };
            stats.iterations += 1;
            match parse_proof_string(proof, &axioms) {
                Ok(derivation) => {
                    let key = derivation.key();
                    let outcome = registry.try_insert(key, proof, derivation.conclusion);
                    if outcome.is_new() {
                        stats.representatives += 1;
                    } else {
                        stats.redundant += 1;
                    }
                }
                Err(_) => stats.invalid += 1,
            }
        }
        // Axioms with the same conclusion as an earlier one don't stay representatives.
        table.publish(
            1,
            registry
                .entries_with_lengths(&[1])
                .into_iter()
                .map(|(_, e)| e.proof)
                .collect(),
        );
        Collector {
            axioms,
            config,
            table,
            registry,
            history: vec![RoundStats {
                per_length: vec![stats],
            }],
        }
    }

    /// Reloads every consecutive length saved in the store, starting from the axioms.
    pub fn resume(
        store: &Store,
        axioms: AxiomSet,
        config: EnumerationConfig,
    ) -> Result<Collector, CollectorError> {
        let mut collector = Collector::new(axioms, config);
        let metadata = store.load_metadata()?;
        let step = collector.config.necessitation.step();
        let mut length = 1 + step;
        loop {
            let unfiltered_from = collector.config.redundancy_filter.unfiltered_from(length);
            let Some(stored) = store.load_representatives(length, unfiltered_from)? else {
                break;
            };
            let mut proofs = Vec::with_capacity(stored.len());
            for entry in stored {
                let derivation = parse_proof_string(&entry.proof, &collector.axioms).map_err(
                    |e: ProofError| CollectorError::CorruptProof {
                        proof: entry.proof.clone(),
                        reason: e.to_string(),
                    },
                )?;
                if let Some(recorded) = &entry.conclusion {
                    if recorded.canonical() != derivation.conclusion {
                        return Err(CollectorError::CorruptProof {
                            proof: entry.proof,
                            reason: format!(
                                "derives {}, but {} was recorded",
                                derivation.key(),
                                recorded.to_polish()
                            ),
                        });
                    }
                }
                let key = derivation.key();
                collector
                    .registry
                    .try_insert(key, &entry.proof, derivation.conclusion);
                proofs.push(entry.proof);
            }
            let stats = LengthStats {
                length,
                iterations: metadata
                    .as_ref()
                    .and_then(|m| m.iterations.get(&length).copied())
                    .unwrap_or(0),
                removals: metadata
                    .as_ref()
                    .and_then(|m| m.removals.get(&length).copied())
                    .unwrap_or(0),
                representatives: proofs.len() as u64,
                unfiltered: unfiltered_from.is_some(),
                ..LengthStats::default()
            };
            collector.table.publish(length, proofs);
            collector.history.push(RoundStats {
                per_length: vec![stats],
            });
            length += step;
        }
        info!(
            known_limit = collector.known_limit(),
            representatives = collector.table.total(),
            "resumed"
        );
        Ok(collector)
    }

    pub fn axioms(&self) -> &AxiomSet {
        &self.axioms
    }

    pub fn config(&self) -> &EnumerationConfig {
        &self.config
    }

    pub fn table(&self) -> &RepresentativeTable {
        &self.table
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn history(&self) -> &[RoundStats] {
        &self.history
    }

    /// The highest length with published representatives.
    pub fn known_limit(&self) -> u32 {
        self.table.known_limit()
    }

    /// The representatives of one length, with their conclusions.
    pub fn representatives(&self, length: u32) -> Vec<(String, Formula)> {
        self.registry
            .entries_with_lengths(&[length])
            .into_iter()
            .map(|(_, e)| (e.proof, e.conclusion))
            .collect()
    }

    // The lengths after the known limit, up to the target.
    fn next_lengths(&self, target: u32) -> Vec<u32> {
        let step = self.config.necessitation.step();
        let known_limit = self.known_limit();
        ((known_limit + 1)..=target)
            .filter(|l| (l - known_limit) % step == 0)
            .collect()
    }

    /// Generates every candidate of the given lengths from the current table, keeps the best
    /// proof of each new conclusion, then drops the new conclusions that are instances of a
    /// registered schema. The surviving proofs get published.
    ///
    /// The lengths must be increasing and all beyond the known limit.
    pub fn collect_round(
        &mut self,
        lengths: &[u32],
        cancel: &CancellationToken,
    ) -> Result<RoundStats, CollectorError> {
        let known_limit = self.known_limit();
        let step = self.config.necessitation.step();
        let valid = !lengths.is_empty()
            && lengths.windows(2).all(|w| w[0] < w[1])
            && lengths[0] > known_limit
            && lengths.iter().all(|l| (l - known_limit) % step == 0);
        if !valid {
            return Err(CollectorError::InvalidLengths {
                lengths: lengths.to_vec(),
                known_limit,
            });
        }
        let max_length = lengths[lengths.len() - 1];
        info!(?lengths, known_limit, "collecting");

        let counters = Counters::new(max_length);
        let expected =
            self.evaluate_candidates(lengths, known_limit, max_length, &counters, cancel)?;

        let filtered: Vec<u32> = lengths
            .iter()
            .copied()
            .filter(|l| self.config.redundancy_filter.applies_to(*l))
            .collect();
        let removals = self.remove_schema_instances(&filtered, cancel)?;

        let mut stats = RoundStats::default();
        for &length in lengths {
            let proofs: Vec<String> = self
                .registry
                .entries_with_lengths(&[length])
                .into_iter()
                .map(|(_, e)| e.proof)
                .collect();
            let length_stats = LengthStats {
                length,
                iterations: Counters::get(&counters.iterations, length),
                expected: expected.get(&length).copied().flatten(),
                invalid: Counters::get(&counters.invalid, length),
                redundant: Counters::get(&counters.redundant, length),
                removals: removals.get(&length).copied().unwrap_or(0),
                representatives: proofs.len() as u64,
                unfiltered: !filtered.contains(&length),
            };
            info!(
                length,
                iterations = length_stats.iterations,
                invalid = length_stats.invalid,
                redundant = length_stats.redundant,
                removals = length_stats.removals,
                representatives = length_stats.representatives,
                "collected length"
            );
            self.table.publish(length, proofs);
            stats.per_length.push(length_stats);
        }
        self.history.push(stats.clone());
        Ok(stats)
    }

    fn evaluate_candidates(
        &self,
        lengths: &[u32],
        known_limit: u32,
        max_length: u32,
        counters: &Counters,
        cancel: &CancellationToken,
    ) -> Result<HashMap<u32, Option<u64>>, CollectorError> {
        let generator = Generator::new(
            &self.table,
            known_limit,
            self.config.necessitation,
            max_length,
        );
        let mut expected = HashMap::new();
        for &length in lengths {
            let count = generator.count_candidates(length);
            match count {
                Some(count) => info!(length, expected = count, "generating candidates"),
                None => warn!(length, "candidate count does not fit in 64 bits"),
            }
            expected.insert(length, count);
        }
        let necessitation_index = if self.config.necessitation.is_enabled() {
            NecessitationIndex::build(&self.registry, known_limit)
        } else {
            NecessitationIndex::default()
        };
        let balancer = QueueBalancer::new(
            self.config.workers,
            self.config.queue_capacity,
            self.config.balance_interval,
        );
        let axioms = &self.axioms;
        let registry = &self.registry;

        let balancer_stats = balancer.run(
            |push, stop| {
                let count = generator.generate(lengths, stop, &mut |candidate: &str| {
                    push(candidate.to_string())
                })?;
                debug!(count, "generation finished");
                Ok(())
            },
            |candidate: String| -> Result<(), Infallible> {
                let length = candidate.len();
                Counters::bump(&counters.iterations, length);
                let conclusion = match necessitation_index.conclusion_of(&candidate) {
                    Some(conclusion) => conclusion,
                    None => match parse_proof_string(&candidate, axioms) {
                        Ok(derivation) => derivation.conclusion,
                        Err(_) => {
                            Counters::bump(&counters.invalid, length);
                            return Ok(());
                        }
                    },
                };
                match registry.try_insert(conclusion.to_polish(), &candidate, conclusion) {
                    InsertOutcome::Inserted => {}
                    InsertOutcome::Replaced { displaced_length } => {
                        Counters::bump(&counters.redundant, displaced_length as usize)
                    }
                    InsertOutcome::Redundant => Counters::bump(&counters.redundant, length),
                }
                Ok(())
            },
            cancel,
        )?;
        debug!(
            evaluated = balancer_stats.evaluated,
            rebalanced = balancer_stats.rebalanced,
            stolen = balancer_stats.stolen,
            "evaluated candidates"
        );
        Ok(expected)
    }

    // Removes the entries of these lengths that are instances of another registered conclusion.
    // Returns the number removed per length.
    fn remove_schema_instances(
        &mut self,
        lengths: &[u32],
        cancel: &CancellationToken,
    ) -> Result<HashMap<u32, u64>, CollectorError> {
        let mut answer = HashMap::new();
        if lengths.is_empty() {
            return Ok(answer);
        }
        let candidates = self.registry.entries_with_lengths(lengths);
        let index = self.schema_index();
        debug!(
            candidates = candidates.len(),
            indexed = index.len(),
            "looking for schema instances"
        );

        let redundant: Mutex<Vec<usize>> = Mutex::new(vec![]);
        let balancer = QueueBalancer::new(
            self.config.workers,
            self.config.queue_capacity,
            self.config.balance_interval,
        );
        balancer.run(
            |push, stop| {
                for i in 0..candidates.len() {
                    if stop.is_cancelled() {
                        return Err(Cancelled);
                    }
                    push(i);
                }
                Ok(())
            },
            |i: usize| -> Result<(), Infallible> {
                let (key, entry) = &candidates[i];
                let proof_length = entry.proof.len() as u32;
                if index
                    .find_generalization(&entry.conclusion, proof_length, key)
                    .is_some()
                {
                    redundant.lock().push(i);
                }
                Ok(())
            },
            cancel,
        )?;

        let mut redundant = redundant.into_inner();
        redundant.sort_unstable();
        let keys: Vec<String> = redundant.iter().map(|&i| candidates[i].0.clone()).collect();
        for &i in &redundant {
            *answer.entry(candidates[i].1.proof.len() as u32).or_insert(0) += 1;
        }
        self.registry.remove_keys(&keys);
        Ok(answer)
    }

    /// Every registered conclusion, bucketed for schema lookups.
    pub fn schema_index(&self) -> SchemaIndex {
        SchemaIndex::build_parallel(
            self.registry
                .snapshot()
                .into_iter()
                .map(|(key, e)| (key, e.proof.len() as u32, e.conclusion))
                .collect(),
            self.config.workers,
        )
    }

    /// Collects every length up to `target`.
    /// `on_round` runs after each round, with the collector's state including it.
    pub fn collect_up_to(
        &mut self,
        target: u32,
        strategy: Strategy,
        cancel: &CancellationToken,
        mut on_round: impl FnMut(&Collector, &RoundStats) -> Result<(), CollectorError>,
    ) -> Result<Vec<RoundStats>, CollectorError> {
        let lengths = self.next_lengths(target);
        if lengths.is_empty() {
            return Ok(vec![]);
        }
        let rounds: Vec<Vec<u32>> = match strategy {
            Strategy::Stepwise => lengths.into_iter().map(|l| vec![l]).collect(),
            Strategy::Combined => vec![lengths],
        };
        let mut answer = vec![];
        for round in rounds {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }
            let stats = self.collect_round(&round, cancel)?;
            on_round(self, &stats)?;
            answer.push(stats);
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{NecessitationLimit, RedundancyFilter};

    fn config(necessitation: NecessitationLimit) -> EnumerationConfig {
        EnumerationConfig {
            necessitation,
            workers: 3,
            queue_capacity: 16,
            balance_interval: Duration::from_millis(1),
            redundancy_filter: RedundancyFilter::Enabled,
        }
    }

    fn collector() -> Collector {
        Collector::new(AxiomSet::standard(), config(NecessitationLimit::Disabled))
    }

    #[test]
    fn test_starts_with_the_axioms() {
        let collector = collector();
        assert_eq!(collector.known_limit(), 1);
        assert_eq!(collector.table().get(1), &["1", "2", "3"]);
        assert_eq!(collector.registry().len(), 3);
    }

    #[test]
    fn test_length_three() {
        let mut collector = collector();
        let stats = collector
            .collect_round(&[3], &CancellationToken::new())
            .unwrap();
        let three = &stats.per_length[0];
        assert_eq!(three.iterations, 9);
        assert_eq!(three.expected, Some(9));
        assert_eq!(three.invalid, 3);
        assert_eq!(three.redundant, 0);
        assert_eq!(three.removals, 0);
        assert_eq!(
            collector.table().get(3),
            &["D11", "D12", "D13", "D21", "D22", "D23"]
        );
    }

    #[test]
    fn test_length_five_removes_instances() {
        let mut collector = collector();
        let cancel = CancellationToken::new();
        collector.collect_round(&[3], &cancel).unwrap();
        let stats = collector.collect_round(&[5], &cancel).unwrap();
        let five = &stats.per_length[0];
        assert_eq!(five.iterations, 36);
        assert_eq!(five.expected, Some(36));
        assert_eq!(five.invalid, 12);
        assert_eq!(five.redundant, 9);
        assert_eq!(five.removals, 3);
        assert_eq!(five.representatives, 12);
        let table = collector.table().get(5);
        assert!(table.contains(&"DD211".to_string()));
        assert!(!table.contains(&"DD212".to_string()));
        assert!(!table.contains(&"D2D21".to_string()));
    }

    #[test]
    fn test_rejects_lengths_out_of_sequence() {
        let mut collector = collector();
        let cancel = CancellationToken::new();
        assert!(matches!(
            collector.collect_round(&[1], &cancel),
            Err(CollectorError::InvalidLengths { .. })
        ));
        assert!(matches!(
            collector.collect_round(&[4], &cancel),
            Err(CollectorError::InvalidLengths { .. })
        ));
        assert!(matches!(
            collector.collect_round(&[5, 3], &cancel),
            Err(CollectorError::InvalidLengths { .. })
        ));
    }

    #[test]
    fn test_unfiltered_lengths_keep_instances() {
        let mut config = config(NecessitationLimit::Disabled);
        config.redundancy_filter = RedundancyFilter::DisabledFrom(5);
        let mut collector = Collector::new(AxiomSet::standard(), config);
        let rounds = collector
            .collect_up_to(5, Strategy::Stepwise, &CancellationToken::new(), |_, _| Ok(()))
            .unwrap();
        let five = &rounds[1].per_length[0];
        assert!(five.unfiltered);
        assert_eq!(five.removals, 0);
        assert_eq!(five.representatives, 15);
    }

    #[test]
    fn test_necessitation_shortcut_matches_parsing() {
        let mut collector = Collector::new(
            AxiomSet::standard(),
            config(NecessitationLimit::Bounded(1)),
        );
        let cancel = CancellationToken::new();
        collector.collect_round(&[2], &cancel).unwrap();
        assert_eq!(collector.table().get(2), &["N1", "N2", "N3"]);

        let index = NecessitationIndex::build(collector.registry(), 2);
        assert_eq!(index.len(), 3);
        let shortcut = index.conclusion_of("N2").unwrap();
        let parsed = parse_proof_string("N2", collector.axioms()).unwrap();
        assert_eq!(shortcut, parsed.conclusion);
        assert_eq!(index.conclusion_of("D11"), None);
        assert_eq!(index.conclusion_of("ND11"), None);
    }

    #[test]
    fn test_cancelled_round() {
        let mut collector = collector();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            collector.collect_round(&[3], &cancel),
            Err(CollectorError::Cancelled)
        ));
    }
}
