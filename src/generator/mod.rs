// The generator enumerates candidate proof strings of a given length.
// It is a pushdown machine over the grammar
//
//   S -> X_k | A
//   A -> N A | N X_k | D P P      where P is some X_k or A
//
// X_k stands for a representative proof of length k, taken from the table, and A for a proof
// longer than the known limit, which gets expanded by the grammar. Every pending nonterminal
// carries the exact length it has to produce, so the prefix plus the pending lengths always
// add up to the target length and a branch that can't fit is never entered.
pub mod combinatorics;

use std::collections::HashMap;
use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NecessitationLimit;
use crate::proof::{leading_necessitations, ProofRef, RepresentativeTable, DETACH, NECESSITATE};
use combinatorics::{known_lengths, proof_length_combinations, LengthSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Slot {
    /// A representative of exactly this length.
    Known(u32),

    /// A proof of exactly this length, longer than the known limit.
    Open(u32),
}

impl Slot {
    fn length(&self) -> u32 {
        match self {
            Slot::Known(l) | Slot::Open(l) => *l,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Production {
    Necessitate(Slot),

    /// Major premise first, then minor.
    Detach(Slot, Slot),
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    slot: Slot,

    /// How many N symbols directly precede this slot.
    necessitations: u32,
}

// A choice point records everything needed to undo its expansion.
struct ChoicePoint {
    pending: Pending,

    // The next alternative to try.
    alternative: usize,

    prefix_len: usize,
    stack_len: usize,
}

pub struct Generator<'a> {
    table: &'a RepresentativeTable,
    known_limit: u32,
    necessitation: NecessitationLimit,

    /// The longest length this generator was prepared for.
    max_length: u32,

    /// Productions for each open length, only containing realizable slots.
    productions: Vec<Vec<Production>>,

    /// Whether any proof of this length can be produced.
    realizable: Vec<bool>,
}

impl<'a> Generator<'a> {
    /// Prepares to generate proofs up to `max_length`, using the table for every length up to
    /// `known_limit`.
    pub fn new(
        table: &'a RepresentativeTable,
        known_limit: u32,
        necessitation: NecessitationLimit,
        max_length: u32,
    ) -> Generator<'a> {
        let enabled = necessitation.is_enabled();
        let combinations = proof_length_combinations(known_limit, enabled);
        let size = max_length.max(known_limit) as usize + 1;
        let mut generator = Generator {
            table,
            known_limit,
            necessitation,
            max_length: max_length.max(known_limit),
            productions: vec![vec![]; size],
            realizable: vec![false; size],
        };
        for length in known_lengths(known_limit, enabled) {
            generator.realizable[length as usize] = !table.get(length).is_empty();
        }
        for length in (known_limit + 1)..=max_length {
            let productions = generator.open_productions(length, &combinations);
            generator.realizable[length as usize] = !productions.is_empty();
            generator.productions[length as usize] = productions;
        }
        debug!(
            known_limit,
            max_length,
            combinations = combinations.len(),
            "prepared generator"
        );
        generator
    }

    // Lengths beyond the prepared range have no productions, so asking for one is a bug in
    // the caller.
    fn is_prepared(&self, length: u32) -> bool {
        debug_assert!(
            length <= self.max_length,
            "length {} is beyond the prepared maximum {}",
            length,
            self.max_length
        );
        if length > self.max_length {
            warn!(length, max_length = self.max_length, "length was not prepared");
            return false;
        }
        true
    }

    fn slot_for(&self, length: u32) -> Slot {
        if length <= self.known_limit {
            Slot::Known(length)
        } else {
            Slot::Open(length)
        }
    }

    fn is_realizable(&self, slot: Slot) -> bool {
        let length = slot.length();
        length >= 1 && self.realizable.get(length as usize).copied().unwrap_or(false)
    }

    fn parity_ok(&self, length: u32) -> bool {
        self.necessitation.is_enabled() || length % 2 == 1
    }

    // Expects every shorter open length to be computed already.
    fn open_productions(
        &self,
        length: u32,
        combinations: &[(LengthSlot, LengthSlot)],
    ) -> Vec<Production> {
        let mut answer = vec![];
        if self.necessitation.is_enabled() && length >= 2 {
            let inner = self.slot_for(length - 1);
            if self.is_realizable(inner) {
                answer.push(Production::Necessitate(inner));
            }
        }

        let rest = length - 1;
        let mut push = |major: Slot, minor: Slot| {
            if self.is_realizable(major) && self.is_realizable(minor) {
                answer.push(Production::Detach(major, minor));
            }
        };
        for &(major, minor) in combinations {
            match (major, minor) {
                (LengthSlot::Known(a), LengthSlot::Known(b)) => {
                    if a + b == rest {
                        push(Slot::Known(a), Slot::Known(b));
                    }
                }
                (LengthSlot::Known(a), LengthSlot::Open) => {
                    if rest > a && rest - a > self.known_limit && self.parity_ok(rest - a) {
                        push(Slot::Known(a), Slot::Open(rest - a));
                    }
                }
                (LengthSlot::Open, LengthSlot::Known(b)) => {
                    if rest > b && rest - b > self.known_limit && self.parity_ok(rest - b) {
                        push(Slot::Open(rest - b), Slot::Known(b));
                    }
                }
                (LengthSlot::Open, LengthSlot::Open) => {
                    for a in (self.known_limit + 1)..rest {
                        let b = rest - a;
                        if b > self.known_limit && self.parity_ok(a) && self.parity_ok(b) {
                            push(Slot::Open(a), Slot::Open(b));
                        }
                    }
                }
            }
        }
        answer
    }

    /// Emits every candidate of each of the given lengths.
    /// Passing several lengths at once runs them as one combined descent.
    /// Every length must be within the maximum given to `new`.
    /// Returns the number of candidates emitted.
    pub fn generate(
        &self,
        lengths: &[u32],
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(&str),
    ) -> Result<u64, Cancelled> {
        let mut prefix = String::new();
        let mut total = 0;
        for &length in lengths {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if !self.is_prepared(length) {
                continue;
            }
            let root = self.slot_for(length);
            if !self.is_realizable(root) {
                continue;
            }
            total += self.descend(root, &mut prefix, cancel, emit)?;
        }
        Ok(total)
    }

    fn descend(
        &self,
        root: Slot,
        prefix: &mut String,
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(&str),
    ) -> Result<u64, Cancelled> {
        let target = root.length() as usize;
        let mut count = 0;
        prefix.clear();
        let mut stack = vec![Pending {
            slot: root,
            necessitations: 0,
        }];
        let mut choices: Vec<ChoicePoint> = vec![];

        loop {
            match stack.pop() {
                Some(pending) => choices.push(ChoicePoint {
                    pending,
                    alternative: 0,
                    prefix_len: prefix.len(),
                    stack_len: stack.len(),
                }),
                None => {
                    debug_assert_eq!(prefix.len(), target);
                    emit(prefix.as_str());
                    count += 1;
                    if cancel.is_cancelled() {
                        return Err(Cancelled);
                    }
                }
            }

            // Backtrack to the deepest choice point with an alternative left.
            loop {
                let Some(choice) = choices.last_mut() else {
                    return Ok(count);
                };
                prefix.truncate(choice.prefix_len);
                stack.truncate(choice.stack_len);
                if self.advance(choice, prefix, &mut stack) {
                    break;
                }
                if let Some(exhausted) = choices.pop() {
                    stack.push(exhausted.pending);
                }
            }
        }
    }

    // Applies the next usable alternative of the choice point.
    // Returns false once the alternatives are exhausted.
    fn advance(&self, choice: &mut ChoicePoint, prefix: &mut String, stack: &mut Vec<Pending>) -> bool {
        let run = choice.pending.necessitations;
        match choice.pending.slot {
            Slot::Known(length) => {
                let Ok(length) = u16::try_from(length) else {
                    return false;
                };
                while let Some(proof) = self.table.resolve(ProofRef::Generated {
                    length,
                    index: choice.alternative as u64,
                }) {
                    choice.alternative += 1;
                    if self.necessitation.allows(run + leading_necessitations(proof)) {
                        prefix.push_str(proof);
                        return true;
                    }
                }
                false
            }
            Slot::Open(length) => {
                let productions = &self.productions[length as usize];
                while let Some(&production) = productions.get(choice.alternative) {
                    choice.alternative += 1;
                    match production {
                        Production::Necessitate(inner) => {
                            if !self.necessitation.allows(run + 1) {
                                continue;
                            }
                            prefix.push(NECESSITATE);
                            stack.push(Pending {
                                slot: inner,
                                necessitations: run + 1,
                            });
                        }
                        Production::Detach(major, minor) => {
                            prefix.push(DETACH);
                            stack.push(Pending {
                                slot: minor,
                                necessitations: 0,
                            });
                            stack.push(Pending {
                                slot: major,
                                necessitations: 0,
                            });
                        }
                    }
                    return true;
                }
                false
            }
        }
    }

    /// Counts the candidates `generate` would emit for this length, without generating them.
    /// Returns None if the count doesn't fit in a u64.
    pub fn count_candidates(&self, length: u32) -> Option<u64> {
        if !self.is_prepared(length) {
            return Some(0);
        }
        let root = self.slot_for(length);
        if !self.is_realizable(root) {
            return Some(0);
        }
        let mut memo = HashMap::new();
        self.count_slot(root, 0, &mut memo)
    }

    fn count_slot(
        &self,
        slot: Slot,
        run: u32,
        memo: &mut HashMap<(Slot, u32), Option<u64>>,
    ) -> Option<u64> {
        if let Some(known) = memo.get(&(slot, run)) {
            return *known;
        }
        let answer = match slot {
            Slot::Known(length) => Some(
                self.table
                    .get(length)
                    .iter()
                    .filter(|p| self.necessitation.allows(run + leading_necessitations(p)))
                    .count() as u64,
            ),
            Slot::Open(length) => {
                let mut total: u64 = 0;
                for production in &self.productions[length as usize] {
                    let count = match *production {
                        Production::Necessitate(inner) => {
                            if !self.necessitation.allows(run + 1) {
                                continue;
                            }
                            self.count_slot(inner, run + 1, memo)?
                        }
                        Production::Detach(major, minor) => {
                            let a = self.count_slot(major, 0, memo)?;
                            let b = self.count_slot(minor, 0, memo)?;
                            a.checked_mul(b)?
                        }
                    };
                    total = total.checked_add(count)?;
                }
                Some(total)
            }
        };
        memo.insert((slot, run), answer);
        answer
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::axiom::AxiomSet;

    fn collect(generator: &Generator, lengths: &[u32]) -> Vec<String> {
        let mut answer = vec![];
        let count = generator
            .generate(lengths, &CancellationToken::new(), &mut |c| {
                answer.push(c.to_string())
            })
            .unwrap();
        assert_eq!(count as usize, answer.len());
        answer
    }

    fn base_table() -> RepresentativeTable {
        RepresentativeTable::with_axioms(&AxiomSet::standard())
    }

    #[test]
    fn test_length_one_is_the_axioms() {
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 1);
        assert_eq!(collect(&generator, &[1]), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_length_three_pairs_all_axioms() {
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 3);
        let candidates = collect(&generator, &[3]);
        assert_eq!(candidates.len(), 9);
        let unique: BTreeSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), 9);
        assert!(candidates.iter().all(|c| c.starts_with('D') && c.len() == 3));
        assert_eq!(generator.count_candidates(3), Some(9));
    }

    #[test]
    fn test_even_lengths_are_empty_without_necessitation() {
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 4);
        assert!(collect(&generator, &[2, 4]).is_empty());
    }

    #[test]
    fn test_open_subproofs_expand_freely() {
        // With only the axioms known, length 5 uses every length 3 string as a sub-proof.
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 5);
        let candidates = collect(&generator, &[5]);
        assert_eq!(candidates.len(), 54);
        assert!(candidates.contains(&"DD331".to_string()));
        assert!(candidates.contains(&"D1D33".to_string()));
        assert_eq!(generator.count_candidates(5), Some(54));
    }

    #[test]
    fn test_known_subproofs_come_from_the_table() {
        let mut table = base_table();
        table.publish(3, vec!["D11".to_string(), "D21".to_string()]);
        let generator = Generator::new(&table, 3, NecessitationLimit::Disabled, 5);
        let candidates = collect(&generator, &[5]);
        // D X1 X3 and D X3 X1, each 3 * 2.
        assert_eq!(candidates.len(), 12);
        assert!(candidates.contains(&"DD211".to_string()));
        assert!(!candidates.contains(&"DD311".to_string()));
    }

    #[test]
    fn test_necessitation_budget() {
        let table = base_table();
        let bounded = Generator::new(&table, 1, NecessitationLimit::Bounded(1), 3);
        let candidates = collect(&bounded, &[2, 3]);
        assert!(candidates.contains(&"N1".to_string()));
        assert!(!candidates.iter().any(|c| c.starts_with("NN")));
        assert_eq!(candidates.len(), 3 + 9);

        let unbounded = Generator::new(&table, 1, NecessitationLimit::Unbounded, 3);
        let candidates = collect(&unbounded, &[3]);
        assert!(candidates.contains(&"NN2".to_string()));
        assert_eq!(candidates.len(), 12);
    }

    #[test]
    fn test_leading_necessitations_in_table_count_against_budget() {
        let mut table = base_table();
        table.publish(2, vec!["N1".to_string(), "N2".to_string()]);
        let generator = Generator::new(&table, 2, NecessitationLimit::Bounded(1), 3);
        let candidates = collect(&generator, &[3]);
        assert!(!candidates.contains(&"NN1".to_string()));
        assert!(candidates.contains(&"D11".to_string()));
        assert_eq!(generator.count_candidates(3), Some(candidates.len() as u64));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "beyond the prepared maximum")]
    fn test_unprepared_length_is_a_bug() {
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 3);
        collect(&generator, &[5]);
    }

    #[test]
    fn test_known_lengths_need_no_preparation() {
        let mut table = base_table();
        table.publish(3, vec!["D11".to_string(), "D21".to_string()]);
        let generator = Generator::new(&table, 3, NecessitationLimit::Disabled, 1);
        assert_eq!(collect(&generator, &[3]), vec!["D11", "D21"]);
    }

    #[test]
    fn test_cancellation_stops_generation() {
        let table = base_table();
        let generator = Generator::new(&table, 1, NecessitationLimit::Disabled, 7);
        let cancel = CancellationToken::new();
        let mut seen = 0;
        let result = generator.generate(&[7], &cancel, &mut |_| {
            seen += 1;
            if seen == 10 {
                cancel.cancel();
            }
        });
        assert_eq!(result, Err(Cancelled));
        assert_eq!(seen, 10);
    }
}
